//! Server error types

use thiserror::Error;

/// Failure talking to the TTS backend for one chunk.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend stream failed: {0}")]
    Stream(String),
}

/// Request rejected before a run starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("Text is required")]
    TextRequired,

    #[error("API key is required")]
    ApiKeyRequired,
}

/// The client side of the relay went away.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("peer disconnected")]
pub struct SinkClosed;
