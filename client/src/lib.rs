//! Say TTS client
//!
//! Reads the relay's chunked audio stream, plays it back gaplessly while it
//! is still arriving, and assembles the whole run into one seekable file.

pub mod asset;
pub mod connection;
pub mod decode;
pub mod error;
pub mod output;
pub mod run;
pub mod scheduler;
pub mod sniff;
pub mod state;
pub mod wav;

pub use asset::{AssetPlayer, FinalAsset};
pub use decode::{PlaybackBuffer, SegmentDecoder};
pub use error::{ClientError, DecodeError};
pub use output::{AudioOutput, RodioOutput};
pub use run::{interactive, run, run_with_lines, Command, RunOptions, RunReport};
pub use scheduler::{PlaybackScheduler, SchedulerConfig};
pub use sniff::{detect, AudioFormat, Codec};
pub use state::{AudioSegment, Phase, RunState};
