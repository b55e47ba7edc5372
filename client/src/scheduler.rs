//! Gapless scheduling of decoded segments.
//!
//! A run starts in `Buffering`: decoded buffers are held until the window
//! fills or the stream ends. Playback then schedules every buffer back to
//! back on the output clock, each overlapping its predecessor by the fade
//! length so the ramps cross instead of leaving a click or a gap.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use say_protocol::SAMPLE_RATE;

use crate::decode::PlaybackBuffer;
use crate::error::DecodeError;
use crate::output::AudioOutput;
use crate::state::{Phase, RunState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Buffers held before playback starts
    pub buffer_before_play: usize,
    /// Fade length and overlap between neighbours, in seconds
    pub crossfade: f64,
    /// Head start given to the first buffer
    pub warmup: f64,
    /// How long past the last scheduled end before the run counts as done
    pub end_grace: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            buffer_before_play: 5,
            crossfade: 0.005,
            warmup: 0.05,
            end_grace: 0.5,
        }
    }
}

impl SchedulerConfig {
    fn fade_samples(&self) -> usize {
        (self.crossfade * SAMPLE_RATE as f64) as usize
    }
}

/// Releases items in sequence order no matter the order they arrive in.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    held: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            held: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    /// Store `item` and return every item now contiguous with the ones
    /// already released.
    pub fn insert(&mut self, seq: u64, item: T) -> Vec<T> {
        if seq < self.next {
            warn!("Sequence {} already released, ignoring", seq);
            return Vec::new();
        }
        self.held.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.held.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    /// Number of items released so far.
    pub fn released(&self) -> u64 {
        self.next
    }
}

/// Snapshot for progress display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub phase: Phase,
    pub elapsed: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler<O> {
    output: O,
    config: SchedulerConfig,
    // A failed decode still occupies its slot, as `None`.
    order: ReorderBuffer<Option<PlaybackBuffer>>,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O, config: SchedulerConfig) -> Self {
        Self {
            output,
            config,
            order: ReorderBuffer::default(),
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Every submitted segment has come back from the decoder.
    pub fn all_decoded(&self, state: &RunState) -> bool {
        self.order.released() >= state.submitted()
    }

    /// Take a finished decode. Buffers reach the schedule in submission order.
    pub fn accept(&mut self, state: &mut RunState, seq: u64, decoded: Result<PlaybackBuffer, DecodeError>) {
        let buffer = match decoded {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                warn!("Segment {} dropped from live playback: {}", seq, e);
                state.dropped_segments += 1;
                None
            }
        };

        for buffer in self.order.insert(seq, buffer).into_iter().flatten() {
            self.enqueue(state, buffer);
        }
    }

    /// No more segments will arrive. Starts playback with whatever is held.
    pub fn end_of_stream(&mut self, state: &mut RunState) {
        state.stream_ended = true;
        if state.phase == Phase::Buffering && !state.pending.is_empty() {
            self.start_playback(state);
        }
    }

    fn enqueue(&mut self, state: &mut RunState, buffer: PlaybackBuffer) {
        match state.phase {
            Phase::Buffering => {
                state.pending.push(buffer);
                if state.pending.len() >= self.config.buffer_before_play || state.stream_ended {
                    self.start_playback(state);
                }
            }
            Phase::Playing | Phase::Paused => self.play_buffer(state, buffer),
            Phase::Finished => debug!("Run already finished, buffer discarded"),
        }
    }

    fn start_playback(&mut self, state: &mut RunState) {
        if state.phase != Phase::Buffering {
            return;
        }
        self.output.resume();
        let now = self.output.current_time();
        state.started_at = now;
        state.scheduled_end = now + self.config.warmup;
        state.phase = Phase::Playing;
        info!("Starting playback with {} buffered segments", state.pending.len());

        for buffer in std::mem::take(&mut state.pending) {
            self.play_buffer(state, buffer);
        }
    }

    fn play_buffer(&mut self, state: &mut RunState, mut buffer: PlaybackBuffer) {
        buffer.apply_fades(self.config.fade_samples());

        let now = self.output.current_time();
        let start = (state.scheduled_end - self.config.crossfade).max(now);
        let duration = buffer.duration();
        self.output.schedule(buffer, start);

        state.scheduled_end = start + duration;
        state.total_duration += duration;
    }

    pub fn pause(&mut self, state: &mut RunState) {
        if state.phase == Phase::Playing {
            self.output.suspend();
            state.phase = Phase::Paused;
        }
    }

    pub fn resume(&mut self, state: &mut RunState) {
        if state.phase == Phase::Paused {
            self.output.resume();
            state.phase = Phase::Playing;
        }
    }

    /// Periodic clock check. Moves the run to `Finished` once the stream is
    /// over, every decode is in, and the clock has passed the last buffer.
    pub fn tick(&mut self, state: &mut RunState) -> Tick {
        let now = self.output.current_time();
        let settled = state.stream_ended && self.all_decoded(state);

        match state.phase {
            Phase::Playing => {
                if settled && now > state.scheduled_end + self.config.end_grace {
                    info!("Playback finished");
                    state.phase = Phase::Finished;
                }
            }
            Phase::Buffering if settled && state.pending.is_empty() => {
                info!("Stream ended with nothing to play");
                state.phase = Phase::Finished;
            }
            _ => {}
        }

        let elapsed = match state.phase {
            Phase::Buffering => 0.0,
            Phase::Finished => state.total_duration,
            _ => (now - state.started_at).clamp(0.0, state.total_duration),
        };
        Tick {
            phase: state.phase,
            elapsed,
            duration: state.total_duration,
        }
    }
}
