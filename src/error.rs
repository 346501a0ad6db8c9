//! # Error Handling
//!
//! This module defines the error taxonomy shared by the whole pipeline.
//!
//! ## Error Categories:
//! - **Connection**: the game server could not be reached (triggers a reconnect, never fatal)
//! - **Command**: a remote call failed while connected (one reconnect + retry, then reported per player)
//! - **ProtocolParse**: a server response could not be understood (treated as "no data")
//! - **AudioValidation**: a malformed frame arrived at the ingestion boundary (dropped)
//! - **ModelLoad**: the recognition engine failed to initialise (fatal to the session)
//! - **Config / Vocabulary / Session / Io**: setup and bookkeeping failures
//!
//! A missed detection is not an error: the detector returns `None` for it.
//!
//! ## Propagation:
//! Library code returns `AppResult<T>`. The binary converts everything into
//! `anyhow::Error` at the edge.

use thiserror::Error;

/// Every failure the pipeline can surface.
///
/// ## Usage Example:
/// ```rust
/// use voicecraft::error::BotError;
/// let err = BotError::AudioValidation("odd byte length".to_string());
/// assert!(!err.is_fatal());
/// ```
#[derive(Debug, Error)]
pub enum BotError {
    /// Network-level failure reaching the remote console
    #[error("Connection error: {0}")]
    Connection(String),

    /// A remote command failed on an otherwise established connection
    #[error("Command error: {0}")]
    Command(String),

    /// The remote server answered with something we could not parse
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    /// An inbound audio frame was malformed
    #[error("Audio validation error: {0}")]
    AudioValidation(String),

    /// The speech recognition engine failed to load
    #[error("Model load error: {0}")]
    ModelLoad(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// The phrase vocabulary could not be read, written or validated
    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    /// Session lifecycle misuse (unknown channel, duplicate start, capacity)
    #[error("Session error: {0}")]
    Session(String),

    /// Transcription failed after the engine was loaded
    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    /// Whether this error should abort the session that raised it.
    ///
    /// Only a failed model load is fatal; everything else is logged and
    /// absorbed by the component that observed it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::ModelLoad(_))
    }
}

/// Configuration loading failures become `BotError::Config`.
impl From<config::ConfigError> for BotError {
    fn from(err: config::ConfigError) -> Self {
        BotError::Config(err.to_string())
    }
}

/// JSON failures only happen while reading or writing the vocabulary.
impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Vocabulary(format!("JSON parsing error: {}", err))
    }
}

/// Shorthand for `Result<T, BotError>`.
pub type AppResult<T> = Result<T, BotError>;
