//! Media units exchanged between capture, session and playback.

use std::sync::Arc;
use std::time::Instant;

/// Microphone rate expected by the service (16 kHz mono).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Rate of inline audio returned by the service (24 kHz mono).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// 100 ms at 16 kHz.
pub const DEFAULT_CHUNK_SAMPLES: usize = 1600;
pub const MIN_CHUNK_SAMPLES: usize = 1600;
pub const MAX_CHUNK_SAMPLES: usize = 4096;

pub const FRAME_WIDTH: u32 = 320;
pub const FRAME_HEIGHT: u32 = 240;
pub const FRAME_QUALITY: u8 = 50;

pub const JPEG_MIME: &str = "image/jpeg";

/// Logical direction of an audio chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    Capture,
    Playback,
}

/// A fixed-length block of mono i16 samples. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    samples: Arc<[i16]>,
    sample_rate: u32,
    direction: AudioDirection,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32, direction: AudioDirection) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            direction,
        }
    }

    pub fn capture(samples: Vec<i16>) -> Self {
        Self::new(samples, INPUT_SAMPLE_RATE, AudioDirection::Capture)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Always mono.
    pub fn channels(&self) -> u16 {
        1
    }

    pub fn direction(&self) -> AudioDirection {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Mime type for the `media_chunks` entry.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// A JPEG-encoded still. Discarded after transmission.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn mime_type(&self) -> &'static str {
        JPEG_MIME
    }
}
