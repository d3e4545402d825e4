//! Gapless playback of model audio.
//!
//! [`PlaybackScheduler`] decides when each decoded buffer starts;
//! [`MixerOutput`] realises that timeline sample-accurately, and a device
//! thread pulls frames out of the mixer.

use tokio::sync::mpsc::UnboundedReceiver;

pub mod device;
pub mod mixer;
pub mod scheduler;

pub use device::{DeviceHandle, NullDevice, WavDevice};
#[cfg(feature = "pulse")]
pub use device::PulseDevice;
pub use mixer::{mixer, MixerOutput, MixerRenderer};
pub use scheduler::{AudioOutput, PlaybackItem, PlaybackScheduler, SourceId, DEFAULT_LOOKAHEAD_SECS};

/// An output plus the channel on which it reports finished sources.
pub struct Playback {
    pub(crate) output: Box<dyn AudioOutput>,
    pub(crate) completions: UnboundedReceiver<SourceId>,
}

impl Playback {
    /// Wrap any output; `completions` must carry the ids it reports as finished.
    pub fn new(output: impl AudioOutput + 'static, completions: UnboundedReceiver<SourceId>) -> Self {
        Self {
            output: Box::new(output),
            completions,
        }
    }

    /// A software mixer at `sample_rate`; hand the renderer to a device.
    pub fn mixer(sample_rate: u32) -> (Self, MixerRenderer) {
        let (output, renderer, completions) = mixer(sample_rate);
        (Self::new(output, completions), renderer)
    }
}
