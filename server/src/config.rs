//! Server settings from the environment

use std::time::Duration;

use anyhow::{Context, Result};

use say_protocol::MAX_CHUNK_SIZE;

const DEFAULT_ADDR: &str = "127.0.0.1:9876";
const DEFAULT_BACKEND_URL: &str = "https://api.inworld.ai/tts/v1/voice:stream";
const DEFAULT_MODEL_ID: &str = "inworld-tts-1.5-max";
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: String,
    pub backend_url: String,
    pub model_id: String,
    pub max_chunk_size: usize,
    /// Upper bound on one whole run, against stalled backends
    pub run_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            max_chunk_size: MAX_CHUNK_SIZE,
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_chunk_size = match lookup("SAY_MAX_CHUNK_SIZE") {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("SAY_MAX_CHUNK_SIZE must be a number, got {v:?}"))?,
            None => defaults.max_chunk_size,
        };
        anyhow::ensure!(max_chunk_size > 0, "SAY_MAX_CHUNK_SIZE must be positive");

        let run_timeout = match lookup("SAY_RUN_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(
                v.parse::<u64>()
                    .with_context(|| format!("SAY_RUN_TIMEOUT_SECS must be a number, got {v:?}"))?,
            ),
            None => defaults.run_timeout,
        };

        Ok(Self {
            addr: lookup("SAY_ADDR").unwrap_or(defaults.addr),
            backend_url: lookup("SAY_BACKEND_URL").unwrap_or(defaults.backend_url),
            model_id: lookup("SAY_MODEL_ID").unwrap_or(defaults.model_id),
            max_chunk_size,
            run_timeout,
        })
    }
}
