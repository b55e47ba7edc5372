//! Sequential per-chunk relay between the TTS backend and one client.
//!
//! Chunks are processed strictly one after another. Bytes of chunk `i` are
//! forwarded as they arrive, followed by a `chunkComplete` record on its own
//! line, before any request for chunk `i + 1` is issued. A chunk that has
//! been sent to the backend is always read to the end, even when the client
//! is gone, so a paid backend call is never thrown away halfway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{error, info, warn};

use say_protocol::{ControlRecord, SynthesizeRequest};

use crate::backend::{BackendReply, ChunkRequest, TtsBackend};
use crate::chunker::TextChunk;
use crate::error::{BackendError, SinkClosed};

/// Destination of the framed byte stream.
#[async_trait]
pub trait FrameSink: Send {
    async fn write(&mut self, bytes: Bytes) -> Result<(), SinkClosed>;
}

/// Flags the connection sets while a run is in flight.
#[derive(Debug, Clone, Default)]
pub struct RelayControl {
    cancelled: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

impl RelayControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop before the next chunk; the current one still completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The peer is gone: stop forwarding, finish the current chunk, stop.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Completed,
    Cancelled,
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub total_chunks: u32,
    /// Chunks fully forwarded and acknowledged with `chunkComplete`
    pub forwarded: u32,
    pub failed: u32,
    /// Backend requests issued
    pub requests: u32,
    pub stop: StopReason,
}

enum ChunkFailure {
    Status { status: u16, body: String },
    Transport(BackendError),
}

/// Best-effort writer: the first failed write marks the peer as gone and
/// every later write is skipped.
///
/// A control record that follows forwarded payload is always preceded by
/// exactly one separator `\n`, whatever the payload ended with. Readers drop
/// that one newline, so raw payload survives byte for byte.
struct Forwarder<'a, S> {
    sink: &'a mut S,
    control: &'a RelayControl,
    disconnected: bool,
    payload_open: bool,
}

impl<'a, S: FrameSink> Forwarder<'a, S> {
    fn is_disconnected(&self) -> bool {
        self.disconnected || self.control.is_disconnected()
    }

    async fn write(&mut self, bytes: Bytes) {
        if self.send(bytes).await {
            self.payload_open = true;
        }
    }

    async fn write_record(&mut self, record: &ControlRecord) {
        if self.payload_open {
            self.send(Bytes::from_static(b"\n")).await;
        }
        self.send(Bytes::from(record.to_line())).await;
        self.payload_open = false;
    }

    async fn send(&mut self, bytes: Bytes) -> bool {
        if bytes.is_empty() || self.is_disconnected() {
            return false;
        }
        match self.sink.write(bytes).await {
            Ok(()) => true,
            Err(SinkClosed) => {
                info!("Client disconnected, will stop after current chunk");
                self.disconnected = true;
                false
            }
        }
    }
}

pub struct StreamRelay<B> {
    backend: B,
}

impl<B: TtsBackend> StreamRelay<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Relay every chunk in order into `sink`.
    pub async fn run<S: FrameSink>(
        &self,
        chunks: &[TextChunk],
        request: &SynthesizeRequest,
        control: &RelayControl,
        sink: &mut S,
    ) -> RelaySummary {
        let total = chunks.len() as u32;
        let mut summary = RelaySummary {
            total_chunks: total,
            ..Default::default()
        };
        let mut out = Forwarder {
            sink,
            control,
            disconnected: false,
            payload_open: false,
        };

        for chunk in chunks {
            if out.is_disconnected() {
                info!("Stopping before chunk {}/{} - client disconnected", chunk.index, total);
                summary.stop = StopReason::Disconnected;
                break;
            }
            if control.is_cancelled() {
                info!("Stopping before chunk {}/{} - run cancelled", chunk.index, total);
                summary.stop = StopReason::Cancelled;
                break;
            }

            info!(
                "Processing chunk {}/{} ({} chars)",
                chunk.index,
                total,
                chunk.char_len()
            );
            summary.requests += 1;

            let request = ChunkRequest {
                text: &chunk.content,
                voice_id: &request.voice_id,
                audio_encoding: &request.audio_encoding,
                api_key: &request.api_key,
            };

            match self.relay_chunk(request, &mut out).await {
                Ok(()) => {
                    if out.is_disconnected() {
                        info!("Finished chunk {}, stopping (client disconnected)", chunk.index);
                        summary.stop = StopReason::Disconnected;
                        break;
                    }
                    out.write_record(&ControlRecord::ChunkComplete {
                        chunk_complete: chunk.index,
                        total_chunks: total,
                    })
                    .await;
                    if out.is_disconnected() {
                        summary.stop = StopReason::Disconnected;
                        break;
                    }
                    summary.forwarded += 1;
                }
                Err(ChunkFailure::Status { status, body }) => {
                    error!("Backend error on chunk {}: {} {}", chunk.index, status, body);
                    summary.failed += 1;
                    out.write_record(&ControlRecord::Error {
                        error: format!("Chunk {} failed: {}", chunk.index, status),
                        chunk_index: Some(chunk.index),
                    })
                    .await;
                }
                Err(ChunkFailure::Transport(e)) => {
                    summary.failed += 1;
                    if out.is_disconnected() {
                        warn!("Chunk {} error after disconnect: {}", chunk.index, e);
                        summary.stop = StopReason::Disconnected;
                        break;
                    }
                    error!("Error processing chunk {}: {}", chunk.index, e);
                    out.write_record(&ControlRecord::Error {
                        error: format!("Chunk {} error: {}", chunk.index, e),
                        chunk_index: Some(chunk.index),
                    })
                    .await;
                }
            }
        }

        summary
    }

    async fn relay_chunk<S: FrameSink>(
        &self,
        request: ChunkRequest<'_>,
        out: &mut Forwarder<'_, S>,
    ) -> Result<(), ChunkFailure> {
        let reply = self
            .backend
            .synthesize(request)
            .await
            .map_err(ChunkFailure::Transport)?;

        let mut stream = match reply {
            BackendReply::Streaming(stream) => stream,
            BackendReply::Failed { status, body } => {
                return Err(ChunkFailure::Status { status, body })
            }
        };

        // Read to the end even when nothing can be forwarded anymore.
        while let Some(item) = stream.next().await {
            let bytes = item.map_err(ChunkFailure::Transport)?;
            out.write(bytes).await;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use futures_util::stream;
    use say_protocol::{Frame, FrameDecoder};

    use super::*;

    /// What the scripted backend does for one chunk.
    #[derive(Clone)]
    pub enum Script {
        Audio(Vec<Vec<u8>>),
        Status(u16),
        BreakMidStream,
    }

    pub struct ScriptedBackend {
        scripts: Vec<Script>,
        pub calls: Mutex<Vec<String>>,
        cancel_during: Option<(usize, RelayControl)>,
    }

    impl ScriptedBackend {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts,
                calls: Mutex::new(Vec::new()),
                cancel_during: None,
            }
        }

        fn cancel_during(mut self, call: usize, control: RelayControl) -> Self {
            self.cancel_during = Some((call, control));
            self
        }
    }

    #[async_trait]
    impl TtsBackend for ScriptedBackend {
        async fn synthesize(
            &self,
            request: ChunkRequest<'_>,
        ) -> Result<BackendReply, BackendError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(request.text.to_string());
                calls.len()
            };
            if let Some((at, control)) = &self.cancel_during {
                if *at == call {
                    control.cancel();
                }
            }

            match self.scripts[(call - 1) % self.scripts.len()].clone() {
                Script::Audio(pieces) => {
                    let items = pieces.into_iter().map(|p| Ok(Bytes::from(p)));
                    Ok(BackendReply::Streaming(stream::iter(items).boxed()))
                }
                Script::Status(status) => Ok(BackendReply::Failed {
                    status,
                    body: "nope".into(),
                }),
                Script::BreakMidStream => {
                    let items = vec![
                        Ok(Bytes::from_static(b"partial")),
                        Err(BackendError::Stream("connection reset".into())),
                    ];
                    Ok(BackendReply::Streaming(stream::iter(items).boxed()))
                }
            }
        }
    }

    #[derive(Default)]
    pub struct MemorySink {
        pub data: Vec<u8>,
        pub writes: usize,
        pub fail_after: Option<usize>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn write(&mut self, bytes: Bytes) -> Result<(), SinkClosed> {
            if self.fail_after.is_some_and(|n| self.writes >= n) {
                return Err(SinkClosed);
            }
            self.writes += 1;
            self.data.extend_from_slice(&bytes);
            Ok(())
        }
    }

    fn chunks(n: u32) -> Vec<TextChunk> {
        TextChunk::sequence((1..=n).map(|i| format!("Chunk text {i}.")).collect())
    }

    fn records(data: &[u8]) -> Vec<ControlRecord> {
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.push(data);
        frames.extend(decoder.finish());
        frames
            .into_iter()
            .filter_map(|f| match f {
                Frame::Control(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    fn line(text: &str) -> Vec<u8> {
        format!("{text}\n").into_bytes()
    }

    #[tokio::test]
    async fn test_markers_follow_each_chunk() {
        let relay = StreamRelay::new(ScriptedBackend::new(vec![Script::Audio(vec![
            line("{\"result\":{\"audioContent\":\"AAA=\"}}"),
        ])]));
        let mut sink = MemorySink::default();

        let summary = relay
            .run(&chunks(2), &SynthesizeRequest::new("x"), &RelayControl::new(), &mut sink)
            .await;

        assert_eq!(summary.forwarded, 2);
        assert_eq!(summary.stop, StopReason::Completed);
        let text = String::from_utf8(sink.data).unwrap();
        assert_eq!(
            text,
            "{\"result\":{\"audioContent\":\"AAA=\"}}\n\n{\"chunkComplete\":1,\"totalChunks\":2}\n\
             {\"result\":{\"audioContent\":\"AAA=\"}}\n\n{\"chunkComplete\":2,\"totalChunks\":2}\n"
        );
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_run() {
        let backend = ScriptedBackend::new(vec![
            Script::Audio(vec![line("{\"result\":{\"audioContent\":\"AAA=\"}}")]),
            Script::Status(500),
            Script::Audio(vec![line("{\"result\":{\"audioContent\":\"AAA=\"}}")]),
        ]);
        let relay = StreamRelay::new(backend);
        let mut sink = MemorySink::default();

        let summary = relay
            .run(&chunks(3), &SynthesizeRequest::new("x"), &RelayControl::new(), &mut sink)
            .await;

        assert_eq!(summary.forwarded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(
            records(&sink.data),
            vec![
                ControlRecord::ChunkComplete { chunk_complete: 1, total_chunks: 3 },
                ControlRecord::Error {
                    error: "Chunk 2 failed: 500".into(),
                    chunk_index: Some(2)
                },
                ControlRecord::ChunkComplete { chunk_complete: 3, total_chunks: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_during_chunk_two_stops_before_three() {
        let control = RelayControl::new();
        let backend = ScriptedBackend::new(vec![Script::Audio(vec![b"abc".to_vec()])])
            .cancel_during(2, control.clone());
        let relay = StreamRelay::new(backend);
        let mut sink = MemorySink::default();

        let summary = relay
            .run(&chunks(3), &SynthesizeRequest::new("x"), &control, &mut sink)
            .await;

        assert_eq!(summary.forwarded, 2);
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(relay.backend().calls.lock().unwrap().len(), 2);
        assert_eq!(records(&sink.data).len(), 2);
    }

    #[tokio::test]
    async fn test_marker_starts_on_fresh_line() {
        let relay = StreamRelay::new(ScriptedBackend::new(vec![Script::Audio(vec![
            b"raw".to_vec(),
            b"bytes".to_vec(),
        ])]));
        let mut sink = MemorySink::default();

        relay
            .run(&chunks(1), &SynthesizeRequest::new("x"), &RelayControl::new(), &mut sink)
            .await;

        assert_eq!(sink.data, b"rawbytes\n{\"chunkComplete\":1,\"totalChunks\":1}\n".to_vec());
    }

    #[tokio::test]
    async fn test_raw_payload_survives_framing() {
        let payload = vec![0x10, 0x00, b'\n', 0x20, 0x00, b'\n'];
        let relay = StreamRelay::new(ScriptedBackend::new(vec![Script::Audio(vec![
            payload[..2].to_vec(),
            payload[2..].to_vec(),
        ])]));
        let mut sink = MemorySink::default();

        relay
            .run(&chunks(2), &SynthesizeRequest::new("x"), &RelayControl::new(), &mut sink)
            .await;

        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.push(&sink.data);
        frames.extend(decoder.finish());

        let mut per_chunk = vec![Vec::new()];
        for frame in frames {
            match frame {
                Frame::Raw(bytes) => per_chunk.last_mut().unwrap().extend(bytes),
                Frame::Control(_) => per_chunk.push(Vec::new()),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(per_chunk, vec![payload.clone(), payload, Vec::new()]);
    }

    #[tokio::test]
    async fn test_disconnect_finishes_chunk_then_stops() {
        let relay = StreamRelay::new(ScriptedBackend::new(vec![Script::Audio(vec![
            b"one".to_vec(),
            b"two".to_vec(),
            b"three".to_vec(),
        ])]));
        let mut sink = MemorySink {
            fail_after: Some(1),
            ..Default::default()
        };

        let summary = relay
            .run(&chunks(3), &SynthesizeRequest::new("x"), &RelayControl::new(), &mut sink)
            .await;

        assert_eq!(summary.stop, StopReason::Disconnected);
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.forwarded, 0);
        assert_eq!(sink.data, b"one".to_vec());
    }

    #[tokio::test]
    async fn test_peer_gone_flag_stops_at_boundary() {
        let control = RelayControl::new();
        control.disconnect();
        let relay = StreamRelay::new(ScriptedBackend::new(vec![Script::Audio(vec![b"x".to_vec()])]));
        let mut sink = MemorySink::default();

        let summary = relay
            .run(&chunks(2), &SynthesizeRequest::new("x"), &control, &mut sink)
            .await;

        assert_eq!(summary.requests, 0);
        assert!(sink.data.is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_reports_and_continues() {
        let backend = ScriptedBackend::new(vec![
            Script::BreakMidStream,
            Script::Audio(vec![b"ok".to_vec()]),
        ]);
        let relay = StreamRelay::new(backend);
        let mut sink = MemorySink::default();

        let summary = relay
            .run(&chunks(2), &SynthesizeRequest::new("x"), &RelayControl::new(), &mut sink)
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.forwarded, 1);
        let records = records(&sink.data);
        assert!(matches!(
            &records[0],
            ControlRecord::Error { chunk_index: Some(1), error } if error.contains("connection reset")
        ));
        assert_eq!(
            records[1],
            ControlRecord::ChunkComplete { chunk_complete: 2, total_chunks: 2 }
        );
    }
}
