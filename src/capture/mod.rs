//! Audio and video producers.
//!
//! Each producer runs on its own OS thread and hands finished chunks or
//! frames to a [`MediaSink`] without blocking. While the session is not
//! active the producer keeps running and its output is dropped.

pub mod audio;
pub mod video;

pub use audio::{spawn_audio_capture, AudioChunker, AudioSource, WavFileSource};
#[cfg(feature = "pulse")]
pub use audio::PulseMicrophone;
pub use video::{spawn_video_capture, FrameEncoder, FrameSource, StillImageSource, VideoCaptureConfig};
#[cfg(feature = "screen")]
pub use video::ScreenSource;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::error::{CaptureError, SessionError};
use crate::media::{AudioChunk, VideoFrame};
use crate::session::MediaSender;

/// Destination for captured media.
pub trait MediaSink: Send + 'static {
    fn is_active(&self) -> bool;
    fn send_audio(&self, chunk: AudioChunk) -> Result<(), SessionError>;
    fn send_frame(&self, frame: VideoFrame) -> Result<(), SessionError>;
}

impl MediaSink for MediaSender {
    fn is_active(&self) -> bool {
        MediaSender::is_active(self)
    }

    fn send_audio(&self, chunk: AudioChunk) -> Result<(), SessionError> {
        MediaSender::send_audio(self, chunk)
    }

    fn send_frame(&self, frame: VideoFrame) -> Result<(), SessionError> {
        MediaSender::send_frame(self, frame)
    }
}

/// A running producer thread.
pub struct CaptureHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), CaptureError>>>,
}

impl CaptureHandle {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self, CaptureError>
    where
        F: FnOnce(&AtomicBool) -> Result<(), CaptureError> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(format!("talelive-{name}"))
            .spawn(move || {
                let result = body(&flag);
                match &result {
                    Ok(()) => info!("{} capture finished", name),
                    Err(e) => error!("{} capture failed: {}", name, e),
                }
                result
            })?;
        info!("Started {} capture", name);
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the producer to stop after its current item.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the producer to exit and return its outcome. Does not stop it;
    /// call [`stop`](Self::stop) first for endless sources.
    pub fn join(mut self) -> Result<(), CaptureError> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CaptureError::Device(format!("{} capture thread panicked", self.name)))?,
            None => Ok(()),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Sleep for `duration` in short steps, returning early once `stop` is set.
pub(crate) fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records what it is given while `active` is set.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub active: Arc<AtomicBool>,
        pub audio: Arc<Mutex<Vec<AudioChunk>>>,
        pub frames: Arc<Mutex<Vec<VideoFrame>>>,
    }

    impl RecordingSink {
        pub fn active() -> Self {
            let sink = Self::default();
            sink.active.store(true, Ordering::Relaxed);
            sink
        }
    }

    impl MediaSink for RecordingSink {
        fn is_active(&self) -> bool {
            self.active.load(Ordering::Relaxed)
        }

        fn send_audio(&self, chunk: AudioChunk) -> Result<(), SessionError> {
            self.audio.lock().unwrap().push(chunk);
            Ok(())
        }

        fn send_frame(&self, frame: VideoFrame) -> Result<(), SessionError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }
}
