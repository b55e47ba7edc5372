//! One WebSocket connection: request handling and the active run.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use say_protocol::{Request, Response, SynthesizeRequest};

use crate::backend::TtsBackend;
use crate::chunker::{chunk_text, TextChunk};
use crate::config::ServerConfig;
use crate::error::{InputError, SinkClosed};
use crate::relay::{FrameSink, RelayControl, StreamRelay};

const OUTBOUND_CAPACITY: usize = 64;

/// Validate a request and split its text into numbered chunks.
pub fn prepare_chunks(
    request: &SynthesizeRequest,
    max_chunk_size: usize,
) -> Result<Vec<TextChunk>, InputError> {
    if request.text.trim().is_empty() {
        return Err(InputError::TextRequired);
    }
    if request.api_key.trim().is_empty() {
        return Err(InputError::ApiKeyRequired);
    }
    let chunks = chunk_text(&request.text, max_chunk_size);
    if chunks.is_empty() {
        return Err(InputError::TextRequired);
    }
    Ok(TextChunk::sequence(chunks))
}

/// Relay output into the connection's outbound queue.
struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write(&mut self, bytes: Bytes) -> Result<(), SinkClosed> {
        self.tx
            .send(Message::Binary(bytes.to_vec()))
            .await
            .map_err(|_| SinkClosed)
    }
}

struct ActiveRun {
    control: RelayControl,
    handle: JoinHandle<()>,
}

impl ActiveRun {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

async fn reply(tx: &mpsc::Sender<Message>, response: &Response) {
    match serde_json::to_string(response) {
        Ok(json) => {
            if tx.send(Message::Text(json)).await.is_err() {
                debug!("Reply dropped, connection writer is gone");
            }
        }
        Err(e) => error!("Failed to encode response: {}", e),
    }
}

pub async fn handle_connection<B>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    relay: Arc<StreamRelay<B>>,
    config: Arc<ServerConfig>,
) -> Result<()>
where
    B: TtsBackend + 'static,
{
    info!("New connection from: {}", peer_addr);

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // A single writer owns the socket; the relay and the request loop
    // both talk to it through the queue.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Write to {} failed: {}", peer_addr, e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut active: Option<ActiveRun> = None;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket error from {}: {}", peer_addr, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let request: Request = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        let response = Response::Error {
                            message: format!("Invalid request: {}", e),
                        };
                        reply(&out_tx, &response).await;
                        continue;
                    }
                };

                match request {
                    Request::Ping => reply(&out_tx, &Response::Pong).await,
                    Request::Cancel => {
                        if let Some(run) = active.as_ref().filter(|run| run.is_live()) {
                            info!("Cancel requested by {}, stopping after current chunk", peer_addr);
                            run.control.cancel();
                        }
                    }
                    Request::Synthesize(req) => {
                        if active.as_ref().is_some_and(ActiveRun::is_live) {
                            let response = Response::Error {
                                message: "A run is already in progress".to_string(),
                            };
                            reply(&out_tx, &response).await;
                            continue;
                        }

                        match prepare_chunks(&req, config.max_chunk_size) {
                            Ok(chunks) => {
                                active = Some(start_run(
                                    Arc::clone(&relay),
                                    chunks,
                                    req,
                                    config.run_timeout,
                                    out_tx.clone(),
                                    peer_addr,
                                ));
                            }
                            Err(e) => {
                                warn!("Rejected request from {}: {}", peer_addr, e);
                                let response = Response::Error {
                                    message: e.to_string(),
                                };
                                reply(&out_tx, &response).await;
                            }
                        }
                    }
                }
            }
            Message::Binary(_) => {
                warn!("Received unexpected binary message from {}", peer_addr);
            }
            Message::Ping(data) => {
                let _ = out_tx.send(Message::Pong(data)).await;
            }
            Message::Pong(_) => {}
            Message::Close(_) => {
                info!("Client {} disconnected", peer_addr);
                break;
            }
            Message::Frame(_) => {}
        }
    }

    if let Some(run) = active {
        run.control.disconnect();
        if run.is_live() {
            info!("Waiting for in-flight chunk of {} to finish", peer_addr);
        }
        if let Err(e) = run.handle.await {
            error!("Run task for {} failed: {}", peer_addr, e);
        }
    }

    drop(out_tx);
    let _ = writer.await;

    info!("Connection closed: {}", peer_addr);
    Ok(())
}

fn start_run<B>(
    relay: Arc<StreamRelay<B>>,
    chunks: Vec<TextChunk>,
    request: SynthesizeRequest,
    run_timeout: Duration,
    out_tx: mpsc::Sender<Message>,
    peer_addr: SocketAddr,
) -> ActiveRun
where
    B: TtsBackend + 'static,
{
    let control = RelayControl::new();
    let run_control = control.clone();

    let handle = tokio::spawn(async move {
        info!(
            "Processing {} chunks for {} (voice: {}, encoding: {})",
            chunks.len(),
            peer_addr,
            request.voice_id,
            request.audio_encoding
        );
        let start = Instant::now();
        let mut sink = ChannelSink { tx: out_tx.clone() };

        let run = relay.run(&chunks, &request, &run_control, &mut sink);
        let response = match tokio::time::timeout(run_timeout, run).await {
            Ok(summary) => {
                info!(
                    "Run for {} ended ({:?}): {}/{} chunks forwarded, {} failed, in {:?}",
                    peer_addr,
                    summary.stop,
                    summary.forwarded,
                    summary.total_chunks,
                    summary.failed,
                    start.elapsed()
                );
                Response::RunFinished {
                    chunks_forwarded: summary.forwarded,
                    total_chunks: summary.total_chunks,
                }
            }
            Err(_) => {
                warn!("Run for {} exceeded {:?}, aborting", peer_addr, run_timeout);
                Response::Error {
                    message: "TTS run timed out".to_string(),
                }
            }
        };

        if !run_control.is_disconnected() {
            reply(&out_tx, &response).await;
        }
    });

    ActiveRun { control, handle }
}
