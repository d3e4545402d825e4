//! Software mixer implementing [`AudioOutput`].
//!
//! The mixer owns the output clock: it advances only when a device renders
//! frames, so `now()` is exactly `frames_rendered / rate`. Sources are placed
//! on the timeline at `round(at * rate)` and summed where they overlap.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use super::scheduler::{AudioOutput, SourceId};
use crate::codec::resample_linear;
use crate::error::PlaybackError;

struct Voice {
    id: SourceId,
    samples: Arc<[f32]>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct MixerState {
    frames_rendered: u64,
    voices: Vec<Voice>,
}

fn lock(state: &Mutex<MixerState>) -> MutexGuard<'_, MixerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build a mixer running at `sample_rate`. The output half goes to the
/// scheduler, the renderer half to a device, and the receiver yields ids of
/// sources that played to the end.
pub fn mixer(sample_rate: u32) -> (MixerOutput, MixerRenderer, UnboundedReceiver<SourceId>) {
    let state = Arc::new(Mutex::new(MixerState {
        frames_rendered: 0,
        voices: Vec::new(),
    }));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MixerOutput {
            state: state.clone(),
            sample_rate,
        },
        MixerRenderer {
            state,
            sample_rate,
            completions: tx,
        },
        rx,
    )
}

/// Scheduler half of the mixer.
pub struct MixerOutput {
    state: Arc<Mutex<MixerState>>,
    sample_rate: u32,
}

impl MixerOutput {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioOutput for MixerOutput {
    fn now(&self) -> f64 {
        lock(&self.state).frames_rendered as f64 / self.sample_rate as f64
    }

    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, sample_rate: u32, at: f64) -> Result<f64, PlaybackError> {
        if sample_rate == 0 {
            return Err(PlaybackError::InvalidRate(sample_rate));
        }
        let samples: Arc<[f32]> = if sample_rate == self.sample_rate {
            samples
        } else {
            resample_linear(&samples, sample_rate, self.sample_rate).into()
        };
        let requested = (at.max(0.0) * self.sample_rate as f64).round() as u64;
        let mut state = lock(&self.state);
        // frames already handed to the device cannot be written into
        let start_frame = requested.max(state.frames_rendered);
        trace!("Mixer voice {} at frame {} ({} frames)", id, start_frame, samples.len());
        state.voices.push(Voice {
            id,
            samples,
            start_frame,
        });
        Ok(start_frame as f64 / self.sample_rate as f64)
    }

    fn stop(&mut self, id: SourceId) {
        lock(&self.state).voices.retain(|v| v.id != id);
    }
}

/// Pulls mixed mono frames out of the mixer and advances its clock.
#[derive(Clone)]
pub struct MixerRenderer {
    state: Arc<Mutex<MixerState>>,
    sample_rate: u32,
    completions: UnboundedSender<SourceId>,
}

impl MixerRenderer {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Fill `out` with the next `out.len()` frames.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut state = lock(&self.state);
        let block_start = state.frames_rendered;
        let block_end = block_start + out.len() as u64;

        for voice in &state.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for frame in from..to {
                out[(frame - block_start) as usize] += voice.samples[(frame - voice.start_frame) as usize];
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        state.frames_rendered = block_end;
        let completions = &self.completions;
        state.voices.retain(|voice| {
            if voice.end_frame() <= block_end {
                debug!("Source {} finished", voice.id);
                let _ = completions.send(voice.id);
                false
            } else {
                true
            }
        });
    }

    /// No voices left to render.
    pub fn is_silent(&self) -> bool {
        lock(&self.state).voices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_with_rendered_frames() {
        let (output, renderer, _rx) = mixer(24_000);
        assert_eq!(output.now(), 0.0);
        let mut block = vec![0.0; 2400];
        renderer.render(&mut block);
        assert!((output.now() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn voice_lands_on_its_start_frame_and_reports_completion() {
        let (mut output, renderer, mut rx) = mixer(24_000);
        output.start(7, vec![0.5; 240].into(), 24_000, 0.01).unwrap();

        let mut block = vec![0.0; 480];
        renderer.render(&mut block);
        assert!(block[..240].iter().all(|&s| s == 0.0));
        assert!(block[240..].iter().all(|&s| s == 0.5));
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(renderer.is_silent());
    }

    #[test]
    fn adjacent_voices_are_sample_contiguous() {
        let (mut output, renderer, mut rx) = mixer(24_000);
        output.start(0, vec![0.25; 100].into(), 24_000, 0.0).unwrap();
        output.start(1, vec![0.75; 100].into(), 24_000, 100.0 / 24_000.0).unwrap();

        let mut block = vec![0.0; 200];
        renderer.render(&mut block);
        assert!(block[..100].iter().all(|&s| s == 0.25));
        assert!(block[100..].iter().all(|&s| s == 0.75));
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn stopped_voice_is_silent_and_never_completes() {
        let (mut output, renderer, mut rx) = mixer(24_000);
        output.start(3, vec![0.5; 1000].into(), 24_000, 0.0).unwrap();
        let mut block = vec![0.0; 100];
        renderer.render(&mut block);
        output.stop(3);
        renderer.render(&mut block);
        assert!(block.iter().all(|&s| s == 0.0));
        let mut tail = vec![0.0; 2000];
        renderer.render(&mut tail);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn foreign_rates_are_resampled() {
        let (mut output, renderer, mut rx) = mixer(24_000);
        output.start(1, vec![0.1; 1600].into(), 16_000, 0.0).unwrap();
        let mut block = vec![0.0; 2399];
        renderer.render(&mut block);
        assert!(rx.try_recv().is_err(), "2400 frames expected after resampling");
        let mut one = vec![0.0; 1];
        renderer.render(&mut one);
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn start_in_the_rendered_past_keeps_every_sample() {
        let (mut output, renderer, mut rx) = mixer(24_000);
        let samples: Vec<f32> = (1..=960).map(|i| i as f32 / 960.0).collect();
        let at = output.now();
        // the device pulls a block between reading the clock and starting
        let mut block = vec![0.0; 480];
        renderer.render(&mut block);

        let actual = output.start(4, samples.clone().into(), 24_000, at).unwrap();
        assert_eq!(actual, 480.0 / 24_000.0);

        renderer.render(&mut block);
        assert_eq!(block[..], samples[..480]);
        assert!(rx.try_recv().is_err());
        renderer.render(&mut block);
        assert_eq!(block[..], samples[480..]);
        assert_eq!(rx.try_recv().unwrap(), 4);
    }

    #[test]
    fn future_start_is_reported_unchanged() {
        let (mut output, _renderer, _rx) = mixer(24_000);
        assert_eq!(output.start(0, vec![0.0; 10].into(), 24_000, 0.5).unwrap(), 0.5);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let (mut output, _renderer, _rx) = mixer(24_000);
        assert!(matches!(
            output.start(0, vec![0.0; 10].into(), 0, 0.0),
            Err(PlaybackError::InvalidRate(0))
        ));
    }
}
