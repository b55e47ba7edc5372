//! Say TTS relay server
//!
//! Splits long text into backend-sized chunks and relays the backend's
//! streamed audio for each chunk, in order, to a WebSocket client.

pub mod backend;
pub mod chunker;
pub mod config;
pub mod error;
pub mod relay;
pub mod session;

pub use backend::{InworldBackend, TtsBackend};
pub use chunker::{chunk_text, TextChunk};
pub use config::ServerConfig;
pub use relay::{FrameSink, RelayControl, RelaySummary, StopReason, StreamRelay};
