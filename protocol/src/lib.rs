//! Shared protocol definitions for Say client-server communication.
//!
//! The protocol is simple:
//! - Client sends: JSON text message asking for a run over some text
//! - Server returns: a newline-delimited byte stream in binary messages,
//!   mixing forwarded backend audio lines with JSON control records
//!
//! Session-level replies (errors, pong, end of run) come back as JSON text
//! messages so they never mix with the relayed byte stream.

pub mod frame;

use serde::{Deserialize, Serialize};

pub use frame::{Frame, FrameDecoder};

/// Request from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    /// Chunk the text and relay backend audio for every chunk
    Synthesize(SynthesizeRequest),
    /// Stop the active run at the next chunk boundary
    Cancel,
    /// Ping to keep connection alive
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizeRequest {
    /// The text to synthesize
    pub text: String,
    /// Backend voice (e.g., "Mark")
    #[serde(default = "default_voice")]
    pub voice_id: String,
    /// Backend credential, forwarded as-is
    #[serde(default)]
    pub api_key: String,
    /// Requested encoding (e.g., "MP3", "LINEAR16")
    #[serde(default = "default_encoding")]
    pub audio_encoding: String,
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

fn default_encoding() -> String {
    DEFAULT_ENCODING.to_string()
}

impl SynthesizeRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: default_voice(),
            api_key: String::new(),
            audio_encoding: default_encoding(),
        }
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_encoding(mut self, audio_encoding: impl Into<String>) -> Self {
        self.audio_encoding = audio_encoding.into();
        self
    }
}

/// Session-level reply, always sent as a text message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Pong response to ping
    Pong,
    /// The relay stopped; no more binary data follows for this run
    RunFinished {
        chunks_forwarded: u32,
        total_chunks: u32,
    },
    /// Error occurred before or outside of a run
    Error { message: String },
}

/// JSON record the relay interleaves with forwarded audio bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlRecord {
    #[serde(rename_all = "camelCase")]
    ChunkComplete { chunk_complete: u32, total_chunks: u32 },
    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_index: Option<u32>,
    },
}

impl ControlRecord {
    /// Serialize as one newline-terminated line.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_default();
        line.push(b'\n');
        line
    }
}

/// A voice the default backend offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Voice {
    pub id: &'static str,
    pub description: &'static str,
}

pub const VOICES: &[Voice] = &[
    Voice { id: "Mark", description: "Natural male" },
    Voice { id: "Olivia", description: "Natural female" },
    Voice { id: "James", description: "British male" },
    Voice { id: "Sofia", description: "Warm female" },
];

pub const DEFAULT_VOICE: &str = "Mark";
pub const DEFAULT_ENCODING: &str = "MP3";

/// Largest chunk, in characters, sent to the backend in one request
pub const MAX_CHUNK_SIZE: usize = 1900;

/// Audio format constants
pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;
