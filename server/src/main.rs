//! Say TTS Server
//!
//! A WebSocket server that accepts text, chunks it, and relays the TTS
//! backend's streamed audio back chunk by chunk.
//!
//! Usage:
//!   cargo run --release -p say-server
//!
//! The server listens on ws://127.0.0.1:9876 by default (see `SAY_ADDR`).

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use say_server::session::handle_connection;
use say_server::{InworldBackend, ServerConfig, StreamRelay};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("say_server=info".parse()?)
                .add_directive("tokio_tungstenite=warn".parse()?),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env()?);
    info!(
        "Backend {} (model {}), max chunk {} chars, run timeout {:?}",
        config.backend_url, config.model_id, config.max_chunk_size, config.run_timeout
    );

    let backend = InworldBackend::new(&config.backend_url, &config.model_id);
    let relay = Arc::new(StreamRelay::new(backend));

    let listener = TcpListener::bind(&config.addr).await?;
    info!("Say TTS server listening on ws://{}", config.addr);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        let relay = Arc::clone(&relay);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, relay, config).await {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }

    Ok(())
}
