//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (RCON_HOST, RCON_PORT, RCON_PASSWORD)
//! 2. Environment variables (APP_RCON__HOST, APP_COMMANDS__MAX_RADIUS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::device::DevicePreference;
use crate::error::{AppResult, BotError};
use crate::transcription::model::ModelSize;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration that contains all settings.
///
/// Broken into one struct per pipeline stage so each component only
/// receives the section it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub rcon: RconConfig,
    pub audio: AudioConfig,
    pub recognizer: RecognizerConfig,
    pub commands: CommandsConfig,
    pub vocabulary: VocabularyConfig,
    pub sessions: SessionsConfig,
}

/// Remote console connection settings.
///
/// ## Fields:
/// - `host` / `port`: where the game server exposes RCON (25575 is the server default)
/// - `password`: `rcon.password` from the server's properties file; required
/// - `timeout_ms`: upper bound on connect and on every single command round-trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RconConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub timeout_ms: u64,
}

/// Audio ingestion and chunking settings.
///
/// ## Sizing:
/// - Voice transports deliver 20ms frames (~50 per second), so a capacity of
///   1500 frames holds about 30 seconds of speech.
/// - `chunk_seconds` trades latency for recognition context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Rate of the PCM frames delivered by the voice transport
    pub source_sample_rate: u32,
    /// Rate the recognition engine requires
    pub target_sample_rate: u32,
    pub chunk_seconds: u32,
    pub queue_capacity: usize,
    /// How long one `pop` waits before the loop re-checks cancellation
    pub pop_timeout_ms: u64,
    /// Consecutive processing errors before the ingestion loop stops itself
    pub max_consecutive_errors: u32,
    /// Gain applied before recognition; voice channels are often very quiet
    pub input_gain: f32,
    /// When set, every emitted chunk is also written here as a WAV file
    pub save_audio_dir: Option<PathBuf>,
}

/// Speech recognition settings.
///
/// ## Model size trade-offs:
/// - Smaller models: faster, less memory, lower accuracy
/// - Larger models: slower, more memory, better with unusual block names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// tiny, base, small, medium, large
    pub model: String,
    /// auto, cpu, cuda, metal
    pub device: String,
    pub language: String,
    pub beam_size: usize,
    pub vad_threshold: f32,
    pub min_silence_ms: u32,
    pub min_speech_ms: u32,
    pub speech_pad_ms: u32,
    pub log_prob_threshold: f32,
    pub no_speech_threshold: f32,
    /// Size of the worker pool that runs model loading and inference
    pub worker_threads: usize,
}

/// World-edit command settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Phrase that must co-occur with a vocabulary word before anything runs
    pub trigger_phrase: String,
    /// Block written in place of the detected block
    pub replacement_block: String,
    pub default_radius: u32,
    pub max_radius: u32,
    pub cooldown_seconds: u64,
    /// Rate-limit per speaker instead of one global key
    pub per_speaker_cooldown: bool,
    /// Half-width of the horizontal footprint cleared around each player
    pub chunk_radius: u32,
    pub world_min_y: i32,
    pub world_max_y: i32,
    /// Largest number of blocks the server accepts in one fill command
    pub block_ceiling: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// One session per channel, at most this many channels at once
    pub max_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rcon: RconConfig {
                host: "localhost".to_string(),
                port: 25575,
                password: String::new(),
                timeout_ms: 5000,
            },
            audio: AudioConfig {
                source_sample_rate: 48000, // Voice transports decode Opus at 48kHz
                target_sample_rate: 16000, // Whisper's required rate
                chunk_seconds: 3,
                queue_capacity: 1500,
                pop_timeout_ms: 50,
                max_consecutive_errors: 5,
                input_gain: 3.0,
                save_audio_dir: None,
            },
            recognizer: RecognizerConfig {
                model: "base".to_string(),
                device: "auto".to_string(),
                language: "en".to_string(),
                beam_size: 5,
                vad_threshold: 0.2,
                min_silence_ms: 200,
                min_speech_ms: 100,
                speech_pad_ms: 300,
                log_prob_threshold: -1.5,
                no_speech_threshold: 0.7,
                worker_threads: 2,
            },
            commands: CommandsConfig {
                trigger_phrase: "clear chunk".to_string(),
                replacement_block: "minecraft:air".to_string(),
                default_radius: 3,
                max_radius: 10,
                cooldown_seconds: 5,
                per_speaker_cooldown: true,
                chunk_radius: 8,
                world_min_y: -64,
                world_max_y: 320,
                block_ceiling: 32768,
            },
            vocabulary: VocabularyConfig {
                path: PathBuf::from("config/block_words.json"),
            },
            sessions: SessionsConfig { max_sessions: 4 },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_RCON__HOST=mc.example.net`
    /// - `APP_COMMANDS__COOLDOWN_SECONDS=10`
    /// - `RCON_PASSWORD=hunter2`: special case so secrets can come from the usual deployment variable
    pub fn load() -> AppResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("RCON_HOST") {
            settings = settings.set_override("rcon.host", host)?;
        }
        if let Ok(port) = env::var("RCON_PORT") {
            settings = settings.set_override("rcon.port", port)?;
        }
        if let Ok(password) = env::var("RCON_PASSWORD") {
            settings = settings.set_override("rcon.password", password)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - RCON is reachable in principle (password set, port not 0)
    /// - Queue, pool and chunk sizes are non-zero
    /// - Model size and device names are recognized
    /// - The resample ratio is an integer (decimation only)
    /// - Radius bounds and the world span are ordered
    /// - A one-block-high slab of the chunk footprint fits under the ceiling
    pub fn validate(&self) -> AppResult<()> {
        if self.rcon.password.is_empty() {
            return Err(BotError::Config("RCON password must be set".to_string()));
        }
        if self.rcon.port == 0 {
            return Err(BotError::Config("RCON port cannot be 0".to_string()));
        }

        if self.audio.queue_capacity == 0 {
            return Err(BotError::Config("Audio queue capacity must be greater than 0".to_string()));
        }
        if self.audio.chunk_seconds == 0 {
            return Err(BotError::Config("Chunk duration must be greater than 0".to_string()));
        }
        if self.audio.target_sample_rate == 0
            || self.audio.source_sample_rate % self.audio.target_sample_rate != 0
        {
            return Err(BotError::Config(format!(
                "Source rate {} is not an integer multiple of target rate {}",
                self.audio.source_sample_rate, self.audio.target_sample_rate
            )));
        }

        if self.recognizer.worker_threads == 0 {
            return Err(BotError::Config("Recognizer worker pool must have at least one thread".to_string()));
        }
        self.recognizer.model.parse::<ModelSize>()?;
        self.recognizer.device.parse::<DevicePreference>()?;
        if self.recognizer.beam_size == 0 {
            return Err(BotError::Config("Beam size must be greater than 0".to_string()));
        }

        if self.commands.default_radius > self.commands.max_radius {
            return Err(BotError::Config(format!(
                "Default radius {} exceeds max radius {}",
                self.commands.default_radius, self.commands.max_radius
            )));
        }
        if self.commands.world_min_y > self.commands.world_max_y {
            return Err(BotError::Config("world_min_y must not exceed world_max_y".to_string()));
        }
        let side = 2 * self.commands.chunk_radius as u64 + 1;
        if side * side > self.commands.block_ceiling {
            return Err(BotError::Config(format!(
                "Chunk footprint {}x{} exceeds the block ceiling {}",
                side, side, self.commands.block_ceiling
            )));
        }
        if self.commands.trigger_phrase.trim().is_empty() {
            return Err(BotError::Config("Trigger phrase cannot be empty".to_string()));
        }

        if self.sessions.max_sessions == 0 {
            return Err(BotError::Config("Max sessions must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Number of source samples folded into one target sample.
    pub fn resample_ratio(&self) -> usize {
        (self.audio.source_sample_rate / self.audio.target_sample_rate) as usize
    }
}
