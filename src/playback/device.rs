//! Output devices that drive a [`MixerRenderer`] on a dedicated thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info};

use super::mixer::MixerRenderer;
use crate::codec::f32_sample_to_i16;
use crate::error::PlaybackError;

/// 20 ms at 24 kHz.
const BLOCK_FRAMES: usize = 480;

/// Running output device. Dropping it stops the thread.
pub struct DeviceHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), PlaybackError>>>,
}

impl DeviceHandle {
    fn spawn<F>(name: &'static str, body: F) -> Result<Self, PlaybackError>
    where
        F: FnOnce(Arc<AtomicBool>) -> Result<(), PlaybackError> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(format!("talelive-{name}"))
            .spawn(move || {
                let result = body(flag);
                if let Err(e) = &result {
                    error!("Output device stopped: {}", e);
                }
                result
            })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        info!("Started {} output", name);
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }

    /// Short device label for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop rendering and wait for the thread to finish.
    pub fn join(mut self) -> Result<(), PlaybackError> {
        self.stop.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| PlaybackError::Device(format!("{} output thread panicked", self.name)))?,
            None => Ok(()),
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Keeps the render loop in step with the wall clock.
struct Pacer {
    started: Instant,
    rate: u32,
    frames: u64,
}

impl Pacer {
    fn new(rate: u32) -> Self {
        Self {
            started: Instant::now(),
            rate,
            frames: 0,
        }
    }

    fn advance(&mut self, frames: usize) {
        self.frames += frames as u64;
        let due = self.started + Duration::from_secs_f64(self.frames as f64 / self.rate as f64);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

/// Discards audio but keeps the clock running in real time.
pub struct NullDevice;

impl NullDevice {
    /// Render on a paced thread and throw the samples away.
    pub fn spawn(renderer: MixerRenderer) -> Result<DeviceHandle, PlaybackError> {
        DeviceHandle::spawn("null", move |stop| {
            let mut pacer = Pacer::new(renderer.sample_rate());
            let mut block = vec![0.0f32; BLOCK_FRAMES];
            while !stop.load(Ordering::Relaxed) {
                renderer.render(&mut block);
                pacer.advance(block.len());
            }
            Ok(())
        })
    }
}

/// Writes everything the mixer renders to a 16-bit mono WAV file.
pub struct WavDevice {
    path: PathBuf,
    realtime: bool,
}

impl WavDevice {
    /// Write 16-bit mono PCM to `path`, paced to real time by default.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            realtime: true,
        }
    }

    /// Render as fast as possible instead of at wall-clock speed.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    /// Create the file and start rendering into it.
    pub fn spawn(self, renderer: MixerRenderer) -> Result<DeviceHandle, PlaybackError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: renderer.sample_rate(),
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&self.path, spec)?;
        info!("Recording playback to {:?}", self.path);
        let realtime = self.realtime;

        DeviceHandle::spawn("wav", move |stop| {
            let mut pacer = Pacer::new(renderer.sample_rate());
            let mut block = vec![0.0f32; BLOCK_FRAMES];
            while !stop.load(Ordering::Relaxed) {
                renderer.render(&mut block);
                for &sample in &block {
                    writer.write_sample(f32_sample_to_i16(sample))?;
                }
                if realtime {
                    pacer.advance(block.len());
                } else if renderer.is_silent() {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            writer.finalize()?;
            Ok(())
        })
    }
}

#[cfg(feature = "pulse")]
pub use pulse::PulseDevice;

#[cfg(feature = "pulse")]
mod pulse {
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use std::sync::atomic::Ordering;

    use super::{DeviceHandle, BLOCK_FRAMES};
    use crate::error::PlaybackError;
    use crate::playback::mixer::MixerRenderer;

    /// Plays the mixer through the default PulseAudio sink. Blocking writes
    /// pace the render loop.
    pub struct PulseDevice;

    impl PulseDevice {
        pub fn spawn(app_name: &str, renderer: MixerRenderer) -> Result<DeviceHandle, PlaybackError> {
            let app_name = app_name.to_string();
            DeviceHandle::spawn("pulse", move |stop| {
                let spec = Spec {
                    format: Format::F32le,
                    channels: 1,
                    rate: renderer.sample_rate(),
                };
                let simple = Simple::new(
                    None,
                    &app_name,
                    Direction::Playback,
                    None,
                    "playback",
                    &spec,
                    None,
                    None,
                )
                .map_err(|e| PlaybackError::Device(e.to_string()))?;

                let mut block = vec![0.0f32; BLOCK_FRAMES];
                while !stop.load(Ordering::Relaxed) {
                    renderer.render(&mut block);
                    simple
                        .write(bytemuck::cast_slice(&block))
                        .map_err(|e| PlaybackError::Device(e.to_string()))?;
                }
                let _ = simple.drain();
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::mixer::mixer;
    use crate::playback::scheduler::AudioOutput;

    #[test]
    fn wav_device_records_rendered_audio() {
        let path = std::env::temp_dir().join(format!("talelive-device-{}.wav", std::process::id()));
        let (mut output, renderer, mut done) = mixer(24_000);
        output.start(0, vec![0.5; 2400].into(), 24_000, 0.0).unwrap();

        let device = WavDevice::new(&path).unpaced().spawn(renderer).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while done.try_recv().is_err() {
            assert!(Instant::now() < deadline, "source never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
        device.join().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert!(samples.len() >= 2400);
        assert!(samples[..2400].iter().all(|&s| s == f32_sample_to_i16(0.5)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn null_device_runs_the_clock() {
        let (output, renderer, _done) = mixer(24_000);
        let device = NullDevice::spawn(renderer).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        device.join().unwrap();
        assert!(output.now() > 0.0);
    }
}
