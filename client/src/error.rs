//! Client error types

use thiserror::Error;

/// A segment that could not be turned into playable samples.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported or corrupt audio: {0}")]
    Unsupported(#[from] rodio::decoder::DecoderError),

    #[error("segment decoded to no samples")]
    Empty,

    #[error("decoder crashed")]
    Crashed,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("no audio output device: {0}")]
    Device(#[from] rodio::StreamError),

    #[error("audio output refused playback: {0}")]
    Play(#[from] rodio::PlayError),

    #[error("cannot open asset: {0}")]
    Asset(#[from] rodio::decoder::DecoderError),

    #[error("connection failed: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server error: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
