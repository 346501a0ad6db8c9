//! # voicecraft - Command Line Entry Point
//!
//! Wires configuration, logging and the shared `AppContext` together and
//! exposes the pipeline as subcommands.
//!
//! ## Subcommands:
//! - **listen**: replay a 48kHz WAV file through a channel session as live
//!   20ms frames; end of file or Ctrl-C stops the session in order
//! - **clear / place / say / players**: drive the command synthesizer directly
//! - **detect**: run the phrase detector on a line of text
//! - **vocab**: list, add or remove vocabulary phrases
//! - **status**: connection check plus pipeline and recognizer counters

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voicecraft::audio::processor::read_wav_mono;
use voicecraft::audio::queue::AudioFrame;
use voicecraft::audio::session::SessionRegistry;
use voicecraft::commands::rcon::RconClient;
use voicecraft::commands::synthesizer::{CooldownKey, Gated, PlayerResults};
use voicecraft::config::AppConfig;
use voicecraft::detection::{normalize_block_id, Vocabulary};
use voicecraft::device::DevicePreference;
use voicecraft::state::AppContext;
use voicecraft::transcription::{ModelSize, WhisperLoader};

#[derive(Parser, Debug)]
#[command(name = "voicecraft", version, about = "Voice-driven world edits for Minecraft over RCON")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a WAV file through a channel session
    Listen {
        /// Mono PCM16 WAV at the configured source rate
        wav: PathBuf,

        #[arg(long, default_value_t = 1)]
        channel: u64,

        /// Speaker id attached to every frame
        #[arg(long)]
        speaker: Option<u64>,

        /// Push frames as fast as the queue accepts them instead of every 20ms
        #[arg(long)]
        fast: bool,
    },
    /// Replace a block with air in the chunk column around every player
    Clear { block: String },
    /// Fill the air around every player with a block
    Place {
        block: String,

        #[arg(long)]
        radius: Option<u32>,
    },
    /// List online players
    Players,
    /// Broadcast a chat message
    Say {
        #[arg(required = true)]
        message: Vec<String>,
    },
    /// Run the phrase detector on some text
    Detect {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Manage the phrase vocabulary
    Vocab {
        #[command(subcommand)]
        action: VocabAction,
    },
    /// Print connection state and counters as JSON
    Status,
}

#[derive(Subcommand, Debug)]
enum VocabAction {
    List,
    Add { phrase: String, block: String },
    Remove { phrase: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    info!("Starting voicecraft v{}", env!("CARGO_PKG_VERSION"));

    let ctx = build_context(config)?;
    let result = run(cli.command, &ctx).await;

    ctx.synthesizer.lock().await.disconnect().await;
    ctx.transcription.close().await;
    result
}

fn build_context(config: AppConfig) -> Result<AppContext> {
    let vocabulary = Vocabulary::load_or_create(&config.vocabulary.path)
        .with_context(|| format!("loading vocabulary from {}", config.vocabulary.path.display()))?;
    let model: ModelSize = config.recognizer.model.parse()?;
    let device: DevicePreference = config.recognizer.device.parse()?;
    let console = Box::new(RconClient::new(&config.rcon));
    let loader = Arc::new(WhisperLoader::new(model, device));
    Ok(AppContext::new(config, vocabulary, console, loader))
}

async fn run(command: Command, ctx: &AppContext) -> Result<()> {
    match command {
        Command::Listen {
            wav,
            channel,
            speaker,
            fast,
        } => listen(ctx, &wav, channel, speaker, fast).await,
        Command::Clear { block } => {
            let block = normalize_block_id(&block)?;
            let gated = ctx
                .synthesizer
                .lock()
                .await
                .clear_around_all_players(&block, CooldownKey::Global)
                .await?;
            print_results(gated)
        }
        Command::Place { block, radius } => {
            let block = normalize_block_id(&block)?;
            let radius = radius.unwrap_or(ctx.config.commands.default_radius);
            let gated = ctx
                .synthesizer
                .lock()
                .await
                .place_around_all_players(&block, radius, CooldownKey::Global)
                .await?;
            print_results(gated)
        }
        Command::Players => {
            let players = ctx.synthesizer.lock().await.online_players().await?;
            println!("{}", serde_json::to_string_pretty(&players)?);
            Ok(())
        }
        Command::Say { message } => {
            let message = message.join(" ");
            match ctx.synthesizer.lock().await.say(&message, CooldownKey::Global).await? {
                Gated::Ran(reply) => println!("{}", reply),
                Gated::CooledDown { remaining } => println!("Cooling down, {:.1}s left", remaining.as_secs_f64()),
            }
            Ok(())
        }
        Command::Detect { text } => {
            let text = text.join(" ");
            let detector = ctx.detector();
            let report = json!({
                "trigger": detector.has_trigger(&text),
                "detection": detector.detect(&text, None),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Vocab { action } => vocab(ctx, action),
        Command::Status => status(ctx).await,
    }
}

/// Feed a WAV file into a fresh session and stop it once the file is consumed.
async fn listen(ctx: &AppContext, path: &Path, channel: u64, speaker: Option<u64>, fast: bool) -> Result<()> {
    let (rate, samples) = read_wav_mono(path)?;
    if rate != ctx.config.audio.source_sample_rate {
        bail!(
            "{} is {}Hz, expected {}Hz",
            path.display(),
            rate,
            ctx.config.audio.source_sample_rate
        );
    }

    let registry = SessionRegistry::new(ctx.clone());
    let session = registry.start(channel).await?;
    let frame_samples = (rate / 50) as usize;
    info!(
        "Replaying {} ({:.1}s) into channel {}",
        path.display(),
        samples.len() as f64 / rate as f64,
        channel
    );

    let feed = async {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        for (sequence, frame) in samples.chunks(frame_samples).enumerate() {
            if fast {
                tokio::task::yield_now().await;
            } else {
                ticker.tick().await;
            }
            let pcm = frame.iter().flat_map(|s| s.to_le_bytes()).collect();
            session.ingest(AudioFrame::new(speaker, pcm, sequence as u64));
        }
        // Let the loop take everything before stopping
        while session.queue_stats().len > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    tokio::select! {
        _ = feed => info!("Reached end of {}", path.display()),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping session"),
    }

    let summary = registry.stop(channel).await?;
    if summary.frames_discarded > 0 {
        warn!("{} frame(s) were never processed", summary.frames_discarded);
    }
    println!("{}", serde_json::to_string_pretty(&ctx.metrics.snapshot())?);
    Ok(())
}

fn vocab(ctx: &AppContext, action: VocabAction) -> Result<()> {
    match action {
        VocabAction::List => {
            for entry in ctx.vocabulary_entries() {
                println!("{:<24} {}", entry.phrase, entry.block_id);
            }
        }
        VocabAction::Add { phrase, block } => {
            let (phrase, block) = ctx.add_vocabulary(&phrase, &block)?;
            println!("Added '{}' -> {}", phrase, block);
        }
        VocabAction::Remove { phrase } => {
            if ctx.remove_vocabulary(&phrase)? {
                println!("Removed '{}'", phrase);
            } else {
                println!("'{}' is not in the vocabulary", phrase);
            }
        }
    }
    Ok(())
}

async fn status(ctx: &AppContext) -> Result<()> {
    let mut synthesizer = ctx.synthesizer.lock().await;
    let reachable = synthesizer.test_connection().await;
    let synth = synthesizer.status();
    let cooldowns: serde_json::Map<String, serde_json::Value> = synth
        .cooldowns
        .iter()
        .map(|(key, left)| (key.to_string(), json!(left.as_secs_f64())))
        .collect();

    let report = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": ctx.uptime_seconds(),
        "rcon": {
            "address": format!("{}:{}", ctx.config.rcon.host, ctx.config.rcon.port),
            "reachable": reachable,
            "state": format!("{:?}", synth.state).to_lowercase(),
            "reconnects": synth.reconnects,
            "cooldowns": cooldowns,
        },
        "recognizer": {
            "model": ctx.config.recognizer.model,
            "state": ctx.transcription.state(),
            "stats": ctx.transcription.stats(),
        },
        "vocabulary_size": ctx.vocabulary_entries().len(),
        "metrics": ctx.metrics.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_results(gated: Gated<PlayerResults>) -> Result<()> {
    match gated {
        Gated::Ran(results) => println!("{}", serde_json::to_string_pretty(&results)?),
        Gated::CooledDown { remaining } => println!("Cooling down, {:.1}s left", remaining.as_secs_f64()),
    }
    Ok(())
}

/// Initialize structured logging.
///
/// `RUST_LOG` controls the filter; without it only voicecraft's own info
/// logs are shown.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "voicecraft=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_defaults() {
        let cli = Cli::try_parse_from(["voicecraft", "listen", "clip.wav"]).unwrap();
        match cli.command {
            Command::Listen {
                wav,
                channel,
                speaker,
                fast,
            } => {
                assert_eq!(wav, PathBuf::from("clip.wav"));
                assert_eq!(channel, 1);
                assert_eq!(speaker, None);
                assert!(!fast);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_vocab_add_and_multiword_text() {
        let cli = Cli::try_parse_from(["voicecraft", "vocab", "add", "diamond block", "diamond_block"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Vocab { action: VocabAction::Add { ref phrase, ref block } }
                if phrase == "diamond block" && block == "diamond_block"
        ));

        let cli = Cli::try_parse_from(["voicecraft", "detect", "clear", "chunk", "stone"]).unwrap();
        assert!(matches!(cli.command, Command::Detect { ref text } if text.len() == 3));
        assert!(Cli::try_parse_from(["voicecraft", "say"]).is_err());
    }
}
