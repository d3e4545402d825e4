//! Gapless playback scheduling against an output clock.
//!
//! The scheduler keeps one cursor, `next_start_time`. Each item starts at
//! `max(now, next_start_time)` and pushes the cursor forward by its own
//! duration, so consecutive items butt up against each other without
//! overlapping. Items that would start more than `lookahead` seconds in the
//! future wait in the pending queue until a scheduled source reports that it
//! finished.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PlaybackError;

/// Identifies one scheduled output source.
pub type SourceId = u64;

/// Where scheduled audio ends up. Implementations report a source's natural
/// completion by sending its id on the channel they were built with; a
/// stopped source must not report completion.
pub trait AudioOutput: Send {
    /// Output clock in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Begin sounding `samples` at clock time `at`. Returns the time the
    /// source actually starts, which is later than `at` when the clock has
    /// already moved past it.
    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, sample_rate: u32, at: f64) -> Result<f64, PlaybackError>;

    /// Silence a source immediately.
    fn stop(&mut self, id: SourceId);
}

/// A decoded buffer waiting for an output slot.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl PlaybackItem {
    /// Mono samples in `[-1, 1]` at `sample_rate`.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Default horizon for scheduling ahead of the clock.
pub const DEFAULT_LOOKAHEAD_SECS: f64 = 2.0;

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start_time: f64,
    pending: VecDeque<PlaybackItem>,
    active: HashMap<SourceId, f64>,
    next_id: SourceId,
    lookahead: f64,
}

impl PlaybackScheduler {
    /// Scheduler with [`DEFAULT_LOOKAHEAD_SECS`] of lookahead.
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        let now = output.now();
        Self {
            output,
            next_start_time: now,
            pending: VecDeque::new(),
            active: HashMap::new(),
            next_id: 0,
            lookahead: DEFAULT_LOOKAHEAD_SECS,
        }
    }

    /// How far past the clock items may be handed to the output.
    pub fn with_lookahead(mut self, seconds: f64) -> Self {
        self.lookahead = seconds.max(0.0);
        self
    }

    /// Queue a buffer for playback. Empty buffers and zero rates are ignored.
    pub fn enqueue(&mut self, samples: Vec<f32>, sample_rate: u32) {
        if samples.is_empty() || sample_rate == 0 {
            warn!("Ignoring empty playback buffer (rate {})", sample_rate);
            return;
        }
        self.pending.push_back(PlaybackItem::new(samples, sample_rate));
        self.drain();
    }

    /// Drop everything not yet started and stop everything sounding.
    /// Returns how many items were discarded.
    pub fn interrupt(&mut self) -> usize {
        let discarded = self.pending.len() + self.active.len();
        self.pending.clear();
        for (id, _) in self.active.drain() {
            self.output.stop(id);
        }
        self.next_start_time = self.output.now();
        debug!("Playback interrupted, {} items discarded", discarded);
        discarded
    }

    /// A source finished on its own. Ids of stopped sources are ignored.
    pub fn on_source_finished(&mut self, id: SourceId) {
        if self.active.remove(&id).is_some() {
            self.drain();
        }
    }

    /// Nothing playing and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Clock time at which everything currently scheduled has finished.
    pub fn playing_until(&self) -> f64 {
        self.active.values().copied().fold(self.output.now(), f64::max)
    }

    fn drain(&mut self) {
        let now = self.output.now();
        while let Some(item) = self.pending.front() {
            let start = now.max(self.next_start_time);
            // Always keep at least one source going so the queue can't stall
            if start - now > self.lookahead && !self.active.is_empty() {
                break;
            }
            let item = match self.pending.pop_front() {
                Some(item) => item,
                None => break,
            };
            let id = self.next_id;
            self.next_id += 1;
            let duration = item.duration();

            let start = match self.output.start(id, item.samples.clone(), item.sample_rate, start) {
                Ok(actual) => actual,
                Err(e) => {
                    warn!("Dropping playback item: {}", e);
                    continue;
                }
            };
            self.active.insert(id, start + duration);
            self.next_start_time = start + duration;
            debug!("Scheduled source {} at {:.3}s for {:.3}s", id, start, duration);
        }
    }
}
