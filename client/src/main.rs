//! Say TTS Client
//!
//! Sends text to the Say server and plays the relayed audio as it streams in.
//!
//! Usage:
//!   # Read an article aloud
//!   SAY_API_KEY=... cargo run --release -p say-client -- --file article.txt --title "Title"
//!
//!   # Play and keep the assembled audio
//!   cargo run --release -p say-client -- --text "Hello world" --output hello
//!
//!   # Interactive: every line typed is read aloud as its own run
//!   cargo run --release -p say-client
//!
//! While running, type a command and press Enter:
//!   p            pause / resume
//!   s <seconds>  seek (once the stream has completed)
//!   r            replay (once playback has finished)
//!   c            cancel after the current chunk
//!   q            quit

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use say_client::{interactive, run_with_lines, RodioOutput, RunOptions, SchedulerConfig};
use say_protocol::{SynthesizeRequest, DEFAULT_ENCODING, DEFAULT_VOICE, VOICES};

#[derive(Parser, Debug)]
#[command(author, version, about = "Say TTS Client")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "ws://127.0.0.1:9876")]
    server: String,

    /// Text to read; without --text or --file, read lines interactively
    #[arg(short, long, conflicts_with = "file")]
    text: Option<String>,

    /// Read the text from a file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Heading read before the text
    #[arg(long)]
    title: Option<String>,

    /// Subheading read after the title
    #[arg(long)]
    subtitle: Option<String>,

    /// Voice to use
    #[arg(short, long, default_value = DEFAULT_VOICE)]
    voice: String,

    /// Audio encoding requested from the backend
    #[arg(short, long, default_value = DEFAULT_ENCODING)]
    encoding: String,

    /// Backend API key
    #[arg(long, env = "SAY_API_KEY", hide_env_values = true, default_value = "")]
    api_key: String,

    /// Save the assembled audio here once the stream ends
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Segments to buffer before playback starts
    #[arg(long, default_value_t = 5)]
    buffer_segments: usize,

    /// Keep running after playback for replay and seeking
    #[arg(long)]
    linger: bool,

    /// List available voices and exit
    #[arg(long)]
    list_voices: bool,
}

/// Title, subtitle and body joined by blank lines, empty parts skipped.
fn assemble_text(title: Option<&str>, subtitle: Option<&str>, body: &str) -> String {
    [title, subtitle, Some(body)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("say_client=info".parse()?)
                .add_directive("tokio_tungstenite=warn".parse()?),
        )
        .init();

    let args = Args::parse();

    if args.list_voices {
        for voice in VOICES {
            println!("{:<8} {}", voice.id, voice.description);
        }
        return Ok(());
    }

    if args.api_key.is_empty() {
        bail!("An API key is required, pass --api-key or set SAY_API_KEY");
    }

    let body = match (&args.text, &args.file) {
        (Some(text), _) => Some(text.clone()),
        (None, Some(path)) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        (None, None) => None,
    };
    let text = body
        .as_deref()
        .map(|body| assemble_text(args.title.as_deref(), args.subtitle.as_deref(), body));
    if text.as_deref().is_some_and(str::is_empty) {
        bail!("Nothing to read, the text is empty");
    }

    let options = RunOptions {
        server: args.server,
        request: SynthesizeRequest::new(text.clone().unwrap_or_default())
            .with_voice(args.voice)
            .with_api_key(args.api_key)
            .with_encoding(args.encoding),
        output: args.output,
        scheduler: SchedulerConfig {
            buffer_before_play: args.buffer_segments.max(1),
            ..SchedulerConfig::default()
        },
        linger: args.linger,
        show_status: true,
    };

    // Plain thread: a blocked stdin read must not hold up runtime shutdown.
    let (line_tx, mut lines) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
        debug!("Input closed");
    });

    match text {
        Some(text) => {
            info!("Reading {} characters with voice {}", text.chars().count(), options.request.voice_id);
            let output = RodioOutput::open()?;
            let report = run_with_lines(&options, output, &mut lines).await?;
            report.log();
        }
        None => {
            println!("Say TTS Client - Interactive Mode");
            println!("=================================");
            println!("Type text and press Enter to read it aloud.");
            println!("While reading: p, s <seconds>, r, c, q");
            println!("Between runs:");
            println!("  :v <voice>  - Change voice");
            println!("  :q or :quit - Exit");
            println!();

            let reports = interactive(&options, || Ok(RodioOutput::open()?), &mut lines).await?;
            info!("Finished {} runs", reports.len());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_text() {
        assert_eq!(assemble_text(None, None, "Body."), "Body.");
        assert_eq!(
            assemble_text(Some("Title"), Some(" "), "Body."),
            "Title\n\nBody."
        );
        assert_eq!(
            assemble_text(Some("Title"), Some("Sub"), "  Body.\n"),
            "Title\n\nSub\n\nBody."
        );
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["say-client", "--text", "hi"]);
        assert_eq!(args.voice, "Mark");
        assert_eq!(args.encoding, "MP3");
        assert_eq!(args.buffer_segments, 5);
        assert!(!args.linger);
    }
}
