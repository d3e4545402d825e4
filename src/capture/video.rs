//! Periodic still-frame capture.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use image::RgbaImage;
use tracing::{debug, info, warn};

use super::{sleep_unless_stopped, CaptureHandle, MediaSink};
use crate::codec::{downscale, encode_jpeg};
use crate::error::{CaptureError, CodecError};
use crate::media::{VideoFrame, FRAME_HEIGHT, FRAME_QUALITY, FRAME_WIDTH};

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const MAX_INTERVAL: Duration = Duration::from_secs(4);

/// Something that can be sampled for a still image.
pub trait FrameSource: Send {
    fn name(&self) -> &str;
    fn grab(&mut self) -> Result<RgbaImage, CaptureError>;
}

/// Downscales and JPEG-encodes rasters.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            quality: FRAME_QUALITY,
        }
    }
}

impl FrameEncoder {
    pub fn encode(&self, raster: &RgbaImage) -> Result<VideoFrame, CodecError> {
        let captured_at = Instant::now();
        let scaled = downscale(raster, self.width, self.height);
        let jpeg = encode_jpeg(&scaled, self.quality)?;
        Ok(VideoFrame {
            jpeg,
            width: scaled.width(),
            height: scaled.height(),
            quality: self.quality,
            captured_at,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VideoCaptureConfig {
    pub interval: Duration,
    pub encoder: FrameEncoder,
}

impl Default for VideoCaptureConfig {
    fn default() -> Self {
        Self {
            interval: MIN_INTERVAL,
            encoder: FrameEncoder::default(),
        }
    }
}

impl VideoCaptureConfig {
    /// Sampling interval, clamped to 1-4 s.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        let clamped = interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
        if clamped != interval {
            warn!("Frame interval {:?} clamped to {:?}", interval, clamped);
        }
        self.interval = clamped;
        self
    }
}

/// Serves the same picture every time, e.g. a book page.
pub struct StillImageSource {
    name: String,
    image: RgbaImage,
}

impl StillImageSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let image = image::open(path)?.to_rgba8();
        info!("Loaded {:?} ({}x{})", path, image.width(), image.height());
        Ok(Self::new(path.display().to_string(), image))
    }

    pub fn new(name: impl Into<String>, image: RgbaImage) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }
}

impl FrameSource for StillImageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn grab(&mut self) -> Result<RgbaImage, CaptureError> {
        Ok(self.image.clone())
    }
}

#[cfg(feature = "screen")]
pub use screen::ScreenSource;

#[cfg(feature = "screen")]
mod screen {
    use image::RgbaImage;
    use tracing::info;
    use xcap::Monitor;

    use super::FrameSource;
    use crate::error::CaptureError;

    /// The first monitor reported by the platform.
    pub struct ScreenSource {
        monitor: Monitor,
    }

    impl ScreenSource {
        pub fn primary() -> Result<Self, CaptureError> {
            let monitor = Monitor::all()
                .map_err(|e| CaptureError::Device(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| CaptureError::Device("no monitor found".to_string()))?;
            info!("Capturing screen");
            Ok(Self { monitor })
        }
    }

    impl FrameSource for ScreenSource {
        fn name(&self) -> &str {
            "screen"
        }

        fn grab(&mut self) -> Result<RgbaImage, CaptureError> {
            self.monitor.capture_image().map_err(|e| {
                let message = e.to_string();
                if message.to_lowercase().contains("permission") {
                    CaptureError::PermissionDenied(message)
                } else {
                    CaptureError::Device(message)
                }
            })
        }
    }
}

/// Sample `source` every `config.interval` on its own thread, handing
/// encoded frames to `sink`. A failing source ends the thread.
pub fn spawn_video_capture<S, K>(mut source: S, config: VideoCaptureConfig, sink: K) -> Result<CaptureHandle, CaptureError>
where
    S: FrameSource + 'static,
    K: MediaSink,
{
    CaptureHandle::spawn("video", move |stop: &AtomicBool| {
        info!("Sampling {} every {:?}", source.name(), config.interval);
        let mut sent = 0u64;
        while !stop.load(Ordering::Relaxed) {
            let tick = Instant::now();
            if sink.is_active() {
                let raster = source.grab()?;
                let frame = config.encoder.encode(&raster)?;
                debug!("Frame {}x{}: {} bytes", frame.width, frame.height, frame.jpeg.len());
                match sink.send_frame(frame) {
                    Ok(()) => sent += 1,
                    Err(e) => debug!("Frame dropped: {}", e),
                }
            }
            sleep_unless_stopped(stop, config.interval.saturating_sub(tick.elapsed()));
        }
        debug!("Video capture sent {} frames", sent);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::RecordingSink;

    #[test]
    fn encoder_downscales_to_protocol_frame() {
        let raster = RgbaImage::from_pixel(1280, 720, image::Rgba([0, 128, 255, 255]));
        let frame = FrameEncoder::default().encode(&raster).unwrap();
        assert_eq!((frame.width, frame.height, frame.quality), (320, 240, 50));
        assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(frame.mime_type(), "image/jpeg");
    }

    #[test]
    fn interval_is_clamped() {
        let config = VideoCaptureConfig::default().with_interval(Duration::from_millis(100));
        assert_eq!(config.interval, Duration::from_secs(1));
        let config = VideoCaptureConfig::default().with_interval(Duration::from_secs(9));
        assert_eq!(config.interval, Duration::from_secs(4));
    }

    #[test]
    fn frames_flow_only_while_active() {
        let sink = RecordingSink::default();
        let source = StillImageSource::new("page", RgbaImage::from_pixel(64, 48, image::Rgba([9, 9, 9, 255])));
        let handle = spawn_video_capture(source, VideoCaptureConfig::default(), sink.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(sink.frames.lock().unwrap().is_empty());

        sink.active.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.frames.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "no frame captured");
            std::thread::sleep(Duration::from_millis(20));
        }
        handle.stop();
        handle.join().unwrap();
        assert_eq!(sink.frames.lock().unwrap()[0].width, 320);
    }

    struct BrokenCamera;

    impl FrameSource for BrokenCamera {
        fn name(&self) -> &str {
            "broken"
        }

        fn grab(&mut self) -> Result<RgbaImage, CaptureError> {
            Err(CaptureError::PermissionDenied("camera".to_string()))
        }
    }

    #[test]
    fn source_failure_ends_only_the_producer() {
        let handle = spawn_video_capture(BrokenCamera, VideoCaptureConfig::default(), RecordingSink::active()).unwrap();
        assert!(matches!(handle.join(), Err(CaptureError::PermissionDenied(_))));
    }
}
