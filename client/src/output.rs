//! Audio output with a sample-accurate schedule.
//!
//! The scheduler places buffers at absolute times on the output clock and
//! lets them overlap by a few milliseconds. rodio's queue only plays sources
//! back to back, so [`RodioOutput`] feeds the device from its own mixing
//! source whose clock is the number of frames the device has pulled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use rodio::{OutputStream, Source};
use tracing::{debug, info};

use say_protocol::{CHANNELS, SAMPLE_RATE};

use crate::decode::PlaybackBuffer;
use crate::error::ClientError;

/// Clocked output that buffers can be scheduled on.
pub trait AudioOutput {
    /// Seconds of audio the device has consumed; stands still while suspended.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `start` seconds on the output clock.
    fn schedule(&mut self, buffer: PlaybackBuffer, start: f64);

    fn suspend(&mut self);

    fn resume(&mut self);
}

struct Scheduled {
    start_frame: u64,
    samples: Vec<f32>,
}

#[derive(Default)]
struct Clock {
    frames: AtomicU64,
    paused: AtomicBool,
    closed: AtomicBool,
}

/// Device output for one run. Dropping it releases the device and silences
/// whatever was still scheduled.
pub struct RodioOutput {
    _stream: OutputStream,
    clock: Arc<Clock>,
    tx: Sender<Scheduled>,
}

impl RodioOutput {
    pub fn open() -> Result<Self, ClientError> {
        let (stream, handle) = OutputStream::try_default()?;
        let clock = Arc::new(Clock::default());
        let (tx, rx) = mpsc::channel();

        handle.play_raw(ScheduleSource {
            clock: Arc::clone(&clock),
            incoming: rx,
            active: Vec::new(),
        })?;

        info!("Audio output opened");
        Ok(Self {
            _stream: stream,
            clock,
            tx,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn current_time(&self) -> f64 {
        self.clock.frames.load(Ordering::Acquire) as f64 / SAMPLE_RATE as f64
    }

    fn schedule(&mut self, buffer: PlaybackBuffer, start: f64) {
        let start_frame = (start.max(0.0) * SAMPLE_RATE as f64).round() as u64;
        let scheduled = Scheduled {
            start_frame,
            samples: buffer.into_samples(),
        };
        if self.tx.send(scheduled).is_err() {
            debug!("Output source is gone, buffer dropped");
        }
    }

    fn suspend(&mut self) {
        self.clock.paused.store(true, Ordering::Release);
    }

    fn resume(&mut self) {
        self.clock.paused.store(false, Ordering::Release);
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.clock.closed.store(true, Ordering::Release);
        debug!("Audio output released");
    }
}

/// Endless mono source mixing every scheduled buffer that covers the
/// current frame. Emits silence while paused without advancing the clock.
struct ScheduleSource {
    clock: Arc<Clock>,
    incoming: Receiver<Scheduled>,
    active: Vec<Scheduled>,
}

impl Iterator for ScheduleSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.clock.closed.load(Ordering::Acquire) {
            return None;
        }
        if self.clock.paused.load(Ordering::Acquire) {
            return Some(0.0);
        }

        while let Ok(scheduled) = self.incoming.try_recv() {
            self.active.push(scheduled);
        }

        let frame = self.clock.frames.fetch_add(1, Ordering::AcqRel);
        let mut mixed = 0.0f32;
        self.active.retain(|s| {
            if frame < s.start_frame {
                return true;
            }
            match s.samples.get((frame - s.start_frame) as usize) {
                Some(sample) => {
                    mixed += *sample;
                    true
                }
                None => false,
            }
        });
        Some(mixed.clamp(-1.0, 1.0))
    }
}

impl Source for ScheduleSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        CHANNELS
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}
