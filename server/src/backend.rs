//! TTS backend client
//!
//! One request per text chunk. A successful response body is handed back as
//! a byte stream so the relay can forward it while it is still arriving.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;

use crate::error::BackendError;

pub type ByteStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Everything the backend needs for one chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRequest<'a> {
    pub text: &'a str,
    pub voice_id: &'a str,
    pub audio_encoding: &'a str,
    pub api_key: &'a str,
}

pub enum BackendReply {
    /// 2xx: body bytes as they arrive
    Streaming(ByteStream),
    /// Non-2xx: status and whatever body came with it
    Failed { status: u16, body: String },
}

#[async_trait]
pub trait TtsBackend: Send + Sync {
    async fn synthesize(&self, request: ChunkRequest<'_>) -> Result<BackendReply, BackendError>;
}

#[derive(Serialize)]
struct InworldRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    audio_config: AudioConfig<'a>,
    temperature: f64,
    model_id: &'a str,
}

#[derive(Serialize)]
struct AudioConfig<'a> {
    audio_encoding: &'a str,
    speaking_rate: f64,
}

/// Inworld streaming TTS endpoint
pub struct InworldBackend {
    client: reqwest::Client,
    url: String,
    model_id: String,
}

impl InworldBackend {
    pub fn new(url: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl TtsBackend for InworldBackend {
    async fn synthesize(&self, request: ChunkRequest<'_>) -> Result<BackendReply, BackendError> {
        let body = InworldRequest {
            text: request.text,
            voice_id: request.voice_id,
            audio_config: AudioConfig {
                audio_encoding: request.audio_encoding,
                speaking_rate: 1.0,
            },
            temperature: 1.1,
            model_id: &self.model_id,
        };

        let response = self
            .client
            .post(&self.url)
            .header(AUTHORIZATION, format!("Basic {}", request.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(BackendReply::Failed {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(BackendError::from))
            .boxed();
        Ok(BackendReply::Streaming(stream))
    }
}
