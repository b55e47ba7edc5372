//! Everything one run knows, owned in one place.

use bytes::Bytes;
use tracing::{debug, info, warn};

use say_protocol::{ControlRecord, Frame};

use crate::decode::PlaybackBuffer;
use crate::sniff::{self, AudioFormat};

/// Bytes received for one chunk, kept for the final asset.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    /// 1-based chunk the bytes belong to
    pub chunk_index: u32,
    /// Arrival order within the run, starting at 0
    pub seq: u64,
    pub format: AudioFormat,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Buffering,
    Playing,
    Paused,
    Finished,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

/// Outcome of feeding one frame into the run.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// A new segment to decode
    Segment(AudioSegment),
    ChunkComplete(Progress),
    ChunkError { chunk_index: Option<u32>, message: String },
}

#[derive(Debug)]
pub struct RunState {
    /// Detected from the first segment, fixed for the rest of the run
    pub format: Option<AudioFormat>,
    pub segments: Vec<AudioSegment>,
    pub phase: Phase,
    /// Decoded buffers held back until playback starts
    pub pending: Vec<PlaybackBuffer>,
    /// Output clock time at which the last scheduled buffer ends
    pub scheduled_end: f64,
    /// Sum of every scheduled buffer's length
    pub total_duration: f64,
    pub started_at: f64,
    pub progress: Progress,
    pub stream_ended: bool,
    pub cancelling: bool,
    pub chunk_errors: u32,
    pub dropped_segments: u32,
    raw: Vec<u8>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            format: None,
            segments: Vec::new(),
            phase: Phase::Buffering,
            pending: Vec::new(),
            scheduled_end: 0.0,
            total_duration: 0.0,
            started_at: 0.0,
            progress: Progress::default(),
            stream_ended: false,
            cancelling: false,
            chunk_errors: 0,
            dropped_segments: 0,
            raw: Vec::new(),
        }
    }

    /// Segments handed out for decoding so far.
    pub fn submitted(&self) -> u64 {
        self.segments.len() as u64
    }

    pub fn ingest(&mut self, frame: Frame) -> Vec<Ingested> {
        let mut events = Vec::new();
        match frame {
            Frame::Audio(bytes) => {
                events.extend(self.add_segment(Bytes::from(bytes)).map(Ingested::Segment))
            }
            Frame::Raw(bytes) => self.raw.extend_from_slice(&bytes),
            Frame::Control(ControlRecord::ChunkComplete {
                chunk_complete,
                total_chunks,
            }) => {
                events.extend(self.flush_raw().map(Ingested::Segment));
                self.progress = Progress {
                    current: chunk_complete,
                    total: total_chunks,
                };
                events.push(Ingested::ChunkComplete(self.progress));
            }
            Frame::Control(ControlRecord::Error { error, chunk_index }) => {
                events.extend(self.flush_raw().map(Ingested::Segment));
                self.chunk_errors += 1;
                warn!("Chunk error: {}", error);
                if let Some(index) = chunk_index {
                    self.progress.current = self.progress.current.max(index);
                }
                events.push(Ingested::ChunkError {
                    chunk_index,
                    message: error,
                });
            }
            Frame::Other(value) => debug!("Ignoring unexpected line: {}", value),
        }
        events
    }

    /// The relay stopped sending. Any raw tail becomes the last segment.
    pub fn end_stream(&mut self) -> Option<AudioSegment> {
        self.stream_ended = true;
        self.flush_raw()
    }

    fn flush_raw(&mut self) -> Option<AudioSegment> {
        if self.raw.is_empty() {
            return None;
        }
        let bytes = Bytes::from(std::mem::take(&mut self.raw));
        self.add_segment(bytes)
    }

    fn add_segment(&mut self, bytes: Bytes) -> Option<AudioSegment> {
        if bytes.is_empty() {
            return None;
        }
        let format = *self.format.get_or_insert_with(|| {
            let format = sniff::detect(&bytes);
            info!("Detected audio format: {}", format);
            format
        });
        let segment = AudioSegment {
            chunk_index: self.progress.current + 1,
            seq: self.submitted(),
            format,
            bytes,
        };
        self.segments.push(segment.clone());
        Some(segment)
    }
}
