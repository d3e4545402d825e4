//! Microphone-side audio: sources, chunking and the producer thread.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{CaptureHandle, MediaSink};
use crate::codec::{downmix_to_mono, f32_to_i16, resample_linear};
use crate::error::{CaptureError, SessionError};
use crate::media::{AudioChunk, INPUT_SAMPLE_RATE, MAX_CHUNK_SAMPLES, MIN_CHUNK_SAMPLES};

/// Buffers a continuous f32 stream into fixed-length i16 chunks. No sample is
/// dropped or repeated across chunk boundaries.
#[derive(Debug)]
pub struct AudioChunker {
    chunk_samples: usize,
    pending: Vec<f32>,
}

impl AudioChunker {
    pub fn new(chunk_samples: usize) -> Result<Self, CaptureError> {
        if !(MIN_CHUNK_SAMPLES..=MAX_CHUNK_SAMPLES).contains(&chunk_samples) {
            return Err(CaptureError::Unsupported(format!(
                "chunk size {chunk_samples} outside {MIN_CHUNK_SAMPLES}..={MAX_CHUNK_SAMPLES}"
            )));
        }
        Ok(Self {
            chunk_samples,
            pending: Vec::with_capacity(chunk_samples * 2),
        })
    }

    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    /// Samples buffered but not yet emitted.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Append samples, returning every chunk that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.chunk_samples;
        if complete == 0 {
            return Vec::new();
        }
        let taken = complete * self.chunk_samples;
        let chunks = self.pending[..taken]
            .chunks_exact(self.chunk_samples)
            .map(|block| AudioChunk::capture(f32_to_i16(block)))
            .collect();
        self.pending.drain(..taken);
        chunks
    }

    /// Emit the remainder padded with silence, if any.
    pub fn flush(&mut self) -> Option<AudioChunk> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending.resize(self.chunk_samples, 0.0);
        let chunk = AudioChunk::capture(f32_to_i16(&self.pending));
        self.pending.clear();
        Some(chunk)
    }
}

/// Anything that yields 16 kHz mono float samples.
pub trait AudioSource: Send {
    fn name(&self) -> &str;

    /// Next block of samples, or `None` once the source is exhausted.
    fn read(&mut self) -> Result<Option<Vec<f32>>, CaptureError>;
}

/// Plays a WAV file as if it were a microphone.
pub struct WavFileSource {
    name: String,
    samples: Vec<f32>,
    position: usize,
    block: usize,
    realtime: bool,
    started: Option<Instant>,
}

impl WavFileSource {
    /// Load the whole file, downmixed and resampled to 16 kHz.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<f32>, hound::Error>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<f32>, hound::Error>>()?
            }
        };
        let mono = downmix_to_mono(&interleaved, spec.channels);
        let samples = resample_linear(&mono, spec.sample_rate, INPUT_SAMPLE_RATE);
        info!(
            "Loaded {:?}: {} Hz x{} -> {} samples at {} Hz",
            path,
            spec.sample_rate,
            spec.channels,
            samples.len(),
            INPUT_SAMPLE_RATE
        );
        Ok(Self::from_samples(path.display().to_string(), samples))
    }

    pub fn from_samples(name: impl Into<String>, samples: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            samples,
            position: 0,
            block: MIN_CHUNK_SAMPLES,
            realtime: true,
            started: None,
        }
    }

    /// Deliver samples as fast as they are read instead of at 16 kHz.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl AudioSource for WavFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> Result<Option<Vec<f32>>, CaptureError> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }
        if self.realtime {
            let started = *self.started.get_or_insert_with(Instant::now);
            let due = started + Duration::from_secs_f64(self.position as f64 / INPUT_SAMPLE_RATE as f64);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        let end = (self.position + self.block).min(self.samples.len());
        let block = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(Some(block))
    }
}

#[cfg(feature = "pulse")]
pub use pulse::PulseMicrophone;

#[cfg(feature = "pulse")]
mod pulse {
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use tracing::info;

    use super::AudioSource;
    use crate::codec::i16_to_f32;
    use crate::error::CaptureError;
    use crate::media::{DEFAULT_CHUNK_SAMPLES, INPUT_SAMPLE_RATE};

    /// Default PulseAudio source, recorded as 16 kHz mono S16LE.
    pub struct PulseMicrophone {
        simple: Simple,
        device: Option<String>,
        block: Vec<i16>,
    }

    impl PulseMicrophone {
        pub fn open(app_name: &str, device: Option<&str>) -> Result<Self, CaptureError> {
            let spec = Spec {
                format: Format::S16le,
                channels: 1,
                rate: INPUT_SAMPLE_RATE,
            };
            let simple = Simple::new(None, app_name, Direction::Record, device, "microphone", &spec, None, None)
                .map_err(|e| {
                    let message = e.to_string();
                    if message.to_lowercase().contains("access") {
                        CaptureError::PermissionDenied(message)
                    } else {
                        CaptureError::Device(message)
                    }
                })?;
            info!("Recording from {}", device.unwrap_or("default source"));
            Ok(Self {
                simple,
                device: device.map(str::to_string),
                block: vec![0; DEFAULT_CHUNK_SAMPLES],
            })
        }
    }

    impl AudioSource for PulseMicrophone {
        fn name(&self) -> &str {
            self.device.as_deref().unwrap_or("pulse")
        }

        fn read(&mut self) -> Result<Option<Vec<f32>>, CaptureError> {
            self.simple
                .read(bytemuck::cast_slice_mut(&mut self.block))
                .map_err(|e| CaptureError::Device(e.to_string()))?;
            Ok(Some(i16_to_f32(&self.block)))
        }
    }
}

/// Run `source` on its own thread, chunking into `chunk_samples` and handing
/// chunks to `sink`. The thread ends when the source is exhausted, when it
/// fails, or when the handle is stopped.
pub fn spawn_audio_capture<S, K>(mut source: S, chunk_samples: usize, sink: K) -> Result<CaptureHandle, CaptureError>
where
    S: AudioSource + 'static,
    K: MediaSink,
{
    let mut chunker = AudioChunker::new(chunk_samples)?;
    CaptureHandle::spawn("audio", move |stop: &AtomicBool| {
        info!("Capturing audio from {}", source.name());
        let mut sent = 0u64;
        let mut dropped = 0u64;
        let mut deliver = |chunk: AudioChunk| {
            if !sink.is_active() {
                dropped += 1;
                return;
            }
            match sink.send_audio(chunk) {
                Ok(()) => sent += 1,
                Err(SessionError::NotActive(_)) => dropped += 1,
                Err(e) => {
                    warn!("Audio chunk not delivered: {}", e);
                    dropped += 1;
                }
            }
        };

        while !stop.load(Ordering::Relaxed) {
            let Some(samples) = source.read()? else {
                break;
            };
            for chunk in chunker.push(&samples) {
                deliver(chunk);
            }
        }
        if let Some(chunk) = chunker.flush() {
            deliver(chunk);
        }
        debug!("Audio capture sent {} chunks, dropped {}", sent, dropped);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::RecordingSink;
    use crate::codec::i16_to_f32;
    use crate::media::AudioDirection;

    #[test]
    fn chunker_preserves_every_sample_across_boundaries() {
        let mut chunker = AudioChunker::new(1600).unwrap();
        let input: Vec<f32> = (0..5000).map(|i| ((i % 200) as f32 / 100.0) - 1.0).collect();

        let mut chunks = Vec::new();
        for piece in input.chunks(777) {
            chunks.extend(chunker.push(piece));
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunker.buffered(), 200);
        assert!(chunks.iter().all(|c| c.len() == 1600 && c.direction() == AudioDirection::Capture));

        let rebuilt: Vec<f32> = chunks.iter().flat_map(|c| i16_to_f32(c.samples())).collect();
        for (a, b) in input.iter().zip(&rebuilt) {
            assert!((a - b).abs() <= 1.0 / 32768.0);
        }

        let tail = chunker.flush().unwrap();
        assert_eq!(tail.len(), 1600);
        assert!(tail.samples()[200..].iter().all(|&s| s == 0));
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn chunk_size_is_bounded() {
        assert!(AudioChunker::new(1599).is_err());
        assert!(AudioChunker::new(4097).is_err());
        assert_eq!(AudioChunker::new(4096).unwrap().chunk_samples(), 4096);
    }

    #[test]
    fn wav_source_is_resampled_to_16k_mono() {
        let path = std::env::temp_dir().join(format!("talelive-capture-{}.wav", std::process::id()));
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..4800 {
            writer.write_sample(8192i16).unwrap();
            writer.write_sample(8192i16).unwrap();
        }
        writer.finalize().unwrap();

        let source = WavFileSource::open(&path).unwrap();
        assert_eq!(source.len(), 1600);
        assert!(source.samples.iter().all(|s| (s - 0.25).abs() < 1e-3));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn producer_drops_chunks_while_inactive() {
        let sink = RecordingSink::default();
        let source = WavFileSource::from_samples("tone", vec![0.1; 4800]).unpaced();
        let handle = spawn_audio_capture(source, 1600, sink.clone()).unwrap();
        handle.join().unwrap();
        assert!(sink.audio.lock().unwrap().is_empty());

        let sink = RecordingSink::active();
        let source = WavFileSource::from_samples("tone", vec![0.1; 4800]).unpaced();
        spawn_audio_capture(source, 1600, sink.clone()).unwrap().join().unwrap();
        let audio = sink.audio.lock().unwrap();
        assert_eq!(audio.len(), 3);
        assert_eq!(audio[0].mime_type(), "audio/pcm;rate=16000");
    }
}
