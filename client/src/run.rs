//! Drives one TTS run from request to the end of playback, and the
//! interactive loop that starts a fresh run per line of input.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use say_protocol::{Frame, FrameDecoder, Request, Response, SynthesizeRequest};

use crate::asset::{AssetPlayer, FinalAsset};
use crate::connection::{self, Inbound, Incoming, Outbound};
use crate::decode::SegmentDecoder;
use crate::error::ClientError;
use crate::output::AudioOutput;
use crate::scheduler::{PlaybackScheduler, SchedulerConfig};
use crate::state::{Ingested, Phase, Progress, RunState};

const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub server: String,
    pub request: SynthesizeRequest,
    /// Where to write the assembled asset, if anywhere
    pub output: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    /// Stay around after playback for replay and seeking
    pub linger: bool,
    /// Print a status line while running
    pub show_status: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    TogglePause,
    Seek(Duration),
    Replay,
    Cancel,
    Quit,
}

impl Command {
    /// `p`, `s <seconds>`, `r`, `c` or `q`.
    pub fn parse(line: &str) -> Option<Command> {
        let mut parts = line.split_whitespace();
        let command = match (parts.next()?, parts.next()) {
            ("p", None) => Command::TogglePause,
            ("r", None) => Command::Replay,
            ("c", None) => Command::Cancel,
            ("q", None) => Command::Quit,
            ("s", Some(secs)) => {
                let secs: f64 = secs.parse().ok()?;
                if !secs.is_finite() || secs < 0.0 {
                    return None;
                }
                Command::Seek(Duration::from_secs_f64(secs))
            }
            _ => return None,
        };
        parts.next().is_none().then_some(command)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub asset: Option<FinalAsset>,
    pub saved: Option<PathBuf>,
    pub progress: Progress,
    pub chunk_errors: u32,
    pub dropped_segments: u32,
    /// Seconds of audio scheduled for live playback
    pub played: f64,
}

impl RunReport {
    pub fn log(&self) {
        info!(
            "Run complete: {}/{} chunks, {} chunk errors, {:.1}s played live",
            self.progress.current, self.progress.total, self.chunk_errors, self.played
        );
        if let Some(path) = &self.saved {
            println!("Audio saved to: {}", path.display());
        }
    }
}

/// Elapsed time as `m:ss`.
pub fn format_clock(secs: f64) -> String {
    let secs = if secs.is_finite() { secs.max(0.0) as u64 } else { 0 };
    format!("{}:{:02}", secs / 60, secs % 60)
}

struct Run<'a, O> {
    options: &'a RunOptions,
    outbound: Outbound,
    state: RunState,
    frames: FrameDecoder,
    decoder: SegmentDecoder,
    live: Option<PlaybackScheduler<O>>,
    player: Option<AssetPlayer>,
    asset: Option<FinalAsset>,
    saved: Option<PathBuf>,
    streaming: bool,
    announced_end: bool,
    status: String,
}

/// Run `options.request` against the server and play it on `output`.
///
/// Returns once playback has finished (or on `q`), with the assembled asset.
pub async fn run<O: AudioOutput>(
    options: &RunOptions,
    output: O,
    commands: &mut mpsc::Receiver<Command>,
) -> Result<RunReport> {
    let (mut outbound, mut inbound) = connection::connect(&options.server).await?;
    outbound
        .send(&Request::Synthesize(options.request.clone()))
        .await?;

    let mut run = Run {
        options,
        outbound,
        state: RunState::new(),
        frames: FrameDecoder::new(),
        decoder: SegmentDecoder::new(),
        live: Some(PlaybackScheduler::new(output, options.scheduler)),
        player: None,
        asset: None,
        saved: None,
        streaming: true,
        announced_end: false,
        status: String::new(),
    };
    run.drive(&mut inbound, commands).await?;
    Ok(run.into_report())
}

/// Read texts from `lines` and run each in turn until `:q` or end of input.
///
/// Every run opens its own output through `open_output`; the previous run's
/// output is dropped before the next one is opened. While a run is going the
/// lines are playback commands. Between runs `:v <voice>` changes the voice.
pub async fn interactive<O, F>(
    base: &RunOptions,
    mut open_output: F,
    lines: &mut mpsc::Receiver<String>,
) -> Result<Vec<RunReport>>
where
    O: AudioOutput,
    F: FnMut() -> Result<O>,
{
    let mut voice = base.request.voice_id.clone();
    let mut reports = Vec::new();

    loop {
        if base.show_status {
            print!("> ");
            let _ = std::io::stdout().flush();
        }
        let Some(line) = lines.recv().await else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":q" || line == ":quit" {
            break;
        }
        if let Some(new_voice) = line.strip_prefix(":v ") {
            voice = new_voice.trim().to_string();
            println!("Voice changed to: {}", voice);
            continue;
        }

        let mut options = base.clone();
        options.request.text = line.to_string();
        options.request.voice_id = voice.clone();
        options.output = base
            .output
            .as_deref()
            .map(|path| numbered_output(path, reports.len() + 1));

        let output = open_output()?;
        match run_with_lines(&options, output, lines).await {
            Ok(report) => {
                report.log();
                reports.push(report);
            }
            Err(e) => error!("Run failed: {:#}", e),
        }
    }

    Ok(reports)
}

/// [`run`] with its commands parsed from lines of input.
pub async fn run_with_lines<O: AudioOutput>(
    options: &RunOptions,
    output: O,
    lines: &mut mpsc::Receiver<String>,
) -> Result<RunReport> {
    let (command_tx, mut commands) = mpsc::channel(16);
    let mut command_tx = Some(command_tx);
    let current = run(options, output, &mut commands);
    tokio::pin!(current);

    loop {
        tokio::select! {
            report = &mut current => return report,
            line = lines.recv(), if command_tx.is_some() => match line {
                Some(line) => match (Command::parse(&line), &command_tx) {
                    (Some(command), Some(tx)) => {
                        if tx.try_send(command).is_err() {
                            warn!("Dropped command {:?}, too many pending", command);
                        }
                    }
                    (None, _) if line.trim().is_empty() => {}
                    (None, _) => println!("Commands: p, s <seconds>, r, c, q"),
                    _ => {}
                },
                None => command_tx = None,
            },
        }
    }
}

/// `path` for the first run, `stem-N.ext` after that.
fn numbered_output(path: &Path, n: usize) -> PathBuf {
    if n <= 1 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}-{}", stem, n),
    };
    path.with_file_name(name)
}

impl<O: AudioOutput> Run<'_, O> {
    async fn drive(
        &mut self,
        inbound: &mut Inbound,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;

        loop {
            tokio::select! {
                incoming = inbound.next(), if self.streaming => {
                    self.on_incoming(incoming).await?;
                }
                Some(decoded) = self.decoder.next() => {
                    if let Some(live) = self.live.as_mut() {
                        live.accept(&mut self.state, decoded.seq, decoded.result);
                    }
                }
                _ = ticker.tick() => {
                    if self.on_tick() {
                        break;
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Quit) => {
                        info!("Quit requested");
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => commands_open = false,
                },
            }
        }

        if self.streaming {
            self.end_stream().await;
        }
        self.clear_status();
        Ok(())
    }

    async fn on_incoming(&mut self, incoming: Option<Result<Incoming, ClientError>>) -> Result<()> {
        match incoming {
            Some(Ok(Incoming::Stream(bytes))) => {
                for frame in self.frames.push(&bytes) {
                    self.on_frame(frame).await;
                    if !self.streaming {
                        break;
                    }
                }
            }
            Some(Ok(Incoming::Reply(Response::RunFinished {
                chunks_forwarded,
                total_chunks,
            }))) => {
                info!(
                    "Server finished the run: {}/{} chunks forwarded",
                    chunks_forwarded, total_chunks
                );
                self.end_stream().await;
            }
            Some(Ok(Incoming::Reply(Response::Error { message }))) => {
                if self.state.segments.is_empty() && self.state.progress.current == 0 {
                    return Err(ClientError::Server(message).into());
                }
                warn!("Run aborted by server: {}", message);
                self.end_stream().await;
            }
            Some(Ok(Incoming::Reply(Response::Pong))) => {}
            Some(Err(e)) => {
                warn!("Connection lost: {}", e);
                self.end_stream().await;
            }
            None => {
                info!("Server closed the connection");
                self.end_stream().await;
            }
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) {
        for event in self.state.ingest(frame) {
            match event {
                Ingested::Segment(segment) => {
                    self.decoder.submit(segment.seq, segment.format, segment.bytes);
                }
                Ingested::ChunkComplete(progress) => {
                    info!("Chunk {}/{} complete", progress.current, progress.total);
                    self.close_if_cancelling().await;
                }
                Ingested::ChunkError { .. } => self.close_if_cancelling().await,
            }
        }
    }

    async fn close_if_cancelling(&mut self) {
        if self.state.cancelling && self.streaming {
            info!("Cancelled, closing the stream");
            self.end_stream().await;
        }
    }

    /// Stop reading, flush what is buffered, and assemble the asset.
    async fn end_stream(&mut self) {
        self.streaming = false;
        self.outbound.close().await;

        let tail: Vec<Frame> = self.frames.finish();
        for frame in tail {
            for event in self.state.ingest(frame) {
                if let Ingested::Segment(segment) = event {
                    self.decoder.submit(segment.seq, segment.format, segment.bytes);
                }
            }
        }
        if let Some(segment) = self.state.end_stream() {
            self.decoder.submit(segment.seq, segment.format, segment.bytes);
        }
        if let Some(live) = self.live.as_mut() {
            live.end_of_stream(&mut self.state);
        }

        self.asset = FinalAsset::finalize(self.state.format, &self.state.segments);
        if self.state.dropped_segments > 0 {
            warn!(
                "{} segments could not be played live but are in the saved audio",
                self.state.dropped_segments
            );
        }
        if let (Some(asset), Some(path)) = (&self.asset, &self.options.output) {
            match asset.save(path) {
                Ok(saved) => self.saved = Some(saved),
                Err(e) => warn!("Failed to save {}: {}", path.display(), e),
            }
        }
    }

    /// Returns true when the run is over.
    fn on_tick(&mut self) -> bool {
        if let Some(player) = &self.player {
            let position = player.position().as_secs_f64();
            let total = self.asset.as_ref().and_then(FinalAsset::duration);
            let total = total.map_or(self.state.total_duration, |d| d.as_secs_f64());
            let label = if player.is_paused() { "Paused" } else { "Playing" };
            let done = player.is_finished() && !self.options.linger;
            self.show_status(format!(
                "{} {} / {}",
                label,
                format_clock(position),
                format_clock(total)
            ));
            return done;
        }

        let Some(live) = self.live.as_mut() else {
            return !self.streaming && !self.options.linger;
        };
        let tick = live.tick(&mut self.state);

        let progress = self.state.progress;
        let status = match tick.phase {
            Phase::Buffering => format!("Buffering... chunk {}/{}", progress.current, progress.total),
            phase => {
                let mut line = format!(
                    "{:?} {} / {}",
                    phase,
                    format_clock(tick.elapsed),
                    format_clock(tick.duration)
                );
                if self.streaming {
                    line.push_str(&format!("  generating {}/{}", progress.current, progress.total));
                }
                line
            }
        };
        self.show_status(status);

        if tick.phase != Phase::Finished {
            return false;
        }
        if !self.options.linger {
            return true;
        }
        if !self.announced_end {
            self.announced_end = true;
            self.clear_status();
            println!("Playback finished. 'r' to replay, 's <seconds>' to seek, 'q' to quit.");
        }
        false
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::TogglePause => {
                if let Some(player) = &self.player {
                    player.toggle_pause();
                } else if let Some(live) = self.live.as_mut() {
                    match self.state.phase {
                        Phase::Playing => live.pause(&mut self.state),
                        Phase::Paused => live.resume(&mut self.state),
                        _ => {}
                    }
                }
            }
            Command::Seek(to) => self.hand_off(to),
            Command::Replay => {
                if self.state.phase == Phase::Finished || self.player.is_some() {
                    self.hand_off(Duration::ZERO);
                } else {
                    println!("Replay is available once playback has finished.");
                }
            }
            Command::Cancel => {
                if !self.streaming {
                    println!("Nothing to cancel, the stream is complete.");
                    return;
                }
                if !self.state.cancelling {
                    self.state.cancelling = true;
                    info!("Cancelling after the current chunk");
                    if let Err(e) = self.outbound.send(&Request::Cancel).await {
                        warn!("Failed to send cancel: {}", e);
                        self.end_stream().await;
                    }
                }
            }
            Command::Quit => {}
        }
    }

    /// Switch from live playback to the assembled asset, positioned at `to`.
    fn hand_off(&mut self, to: Duration) {
        if let Some(player) = &self.player {
            player.seek(to);
            if player.is_paused() {
                player.toggle_pause();
            }
            return;
        }
        let Some(asset) = &self.asset else {
            println!("Seeking is available once the stream has completed.");
            return;
        };

        // Release the live output before the asset player takes the device.
        self.live = None;
        self.state.phase = Phase::Finished;
        match AssetPlayer::open(asset, to) {
            Ok(player) => {
                info!("Switched to the assembled {} asset", asset.format);
                self.player = Some(player);
            }
            Err(e) => warn!("Cannot play the assembled asset: {}", e),
        }
    }

    fn show_status(&mut self, status: String) {
        if !self.options.show_status || status == self.status {
            return;
        }
        print!("\r{:<60}", status);
        let _ = std::io::stdout().flush();
        self.status = status;
    }

    fn clear_status(&mut self) {
        if self.options.show_status && !self.status.is_empty() {
            println!();
            self.status.clear();
        }
    }

    fn into_report(self) -> RunReport {
        RunReport {
            asset: self.asset,
            saved: self.saved,
            progress: self.state.progress,
            chunk_errors: self.state.chunk_errors,
            dropped_segments: self.state.dropped_segments,
            played: self.state.total_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("p"), Some(Command::TogglePause));
        assert_eq!(Command::parse("  q "), Some(Command::Quit));
        assert_eq!(Command::parse("s 12.5"), Some(Command::Seek(Duration::from_secs_f64(12.5))));
        assert_eq!(Command::parse("s"), None);
        assert_eq!(Command::parse("s -1"), None);
        assert_eq!(Command::parse("r now"), None);
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_numbered_output() {
        assert_eq!(numbered_output(Path::new("out/piece"), 1), PathBuf::from("out/piece"));
        assert_eq!(numbered_output(Path::new("out/piece"), 2), PathBuf::from("out/piece-2"));
        assert_eq!(numbered_output(Path::new("piece.wav"), 3), PathBuf::from("piece-3.wav"));
    }

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(0.0), "0:00");
        assert_eq!(format_clock(59.9), "0:59");
        assert_eq!(format_clock(61.0), "1:01");
        assert_eq!(format_clock(3600.0), "60:00");
        assert_eq!(format_clock(-3.0), "0:00");
        assert_eq!(format_clock(f64::NAN), "0:00");
    }
}
