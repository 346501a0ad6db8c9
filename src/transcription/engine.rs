//! # Transcription Session
//!
//! Async wrapper around a blocking speech recognizer.
//!
//! ## Key Responsibilities:
//! - **Lazy, single model load**: the first caller loads the model; concurrent
//!   callers wait on the same async mutex instead of loading twice
//! - **Bounded worker pool**: loading and every inference hold one permit of a
//!   fixed-size semaphore and run on the blocking thread pool, so the
//!   cooperative scheduler driving the audio loops never stalls
//! - **Result shaping**: segments are trimmed and space-joined; empty text is a
//!   normal outcome, not an error
//!
//! ## Lifecycle:
//! ```text
//! Idle --first use--> Loading --ok--> Ready --close--> Closed
//!                        \--error--> Idle
//! ```

use crate::audio::processor::is_silent;
use crate::config::RecognizerConfig;
use crate::error::{AppResult, BotError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};

/// Voice-activity gating thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct VadParams {
    /// Speech probability above which a frame counts as voiced (0.0 - 1.0)
    pub threshold: f32,
    pub min_silence_ms: u32,
    pub min_speech_ms: u32,
    pub speech_pad_ms: u32,
}

/// Per-call recognizer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionParams {
    pub language: String,
    pub beam_size: usize,
    pub vad: VadParams,
    /// Results averaging below this log-probability are suspect
    pub log_prob_threshold: f32,
    /// Suspect results are dropped when no-speech probability is above this
    pub no_speech_threshold: f32,
    /// Words and phrases decoding should favour
    pub bias_phrases: Vec<String>,
    pub sample_rate: u32,
}

impl RecognitionParams {
    pub fn from_config(config: &RecognizerConfig, sample_rate: u32) -> Self {
        Self {
            language: config.language.clone(),
            beam_size: config.beam_size,
            vad: VadParams {
                threshold: config.vad_threshold,
                min_silence_ms: config.min_silence_ms,
                min_speech_ms: config.min_speech_ms,
                speech_pad_ms: config.speech_pad_ms,
            },
            log_prob_threshold: config.log_prob_threshold,
            no_speech_threshold: config.no_speech_threshold,
            bias_phrases: Vec::new(),
            sample_rate,
        }
    }
}

/// A loaded speech recognition model. Calls block; run them off the scheduler.
pub trait SpeechRecognizer: Send + Sync {
    /// Recognize mono f32 audio in `[-1, 1]` and return ordered text segments.
    fn transcribe(&self, audio: &[f32], params: &RecognitionParams) -> anyhow::Result<Vec<String>>;

    fn name(&self) -> String {
        "recognizer".to_string()
    }
}

/// Produces a recognizer, usually by downloading and loading model weights.
#[async_trait]
pub trait RecognizerLoader: Send + Sync {
    async fn load(&self) -> anyhow::Result<Arc<dyn SpeechRecognizer>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Loading,
    Ready,
    Closed,
}

/// Recognized text for one chunk of one speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub speaker_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Default)]
struct EngineMetrics {
    requests: AtomicU64,
    skipped_silent: AtomicU64,
    failures: AtomicU64,
    processing_ms: AtomicU64,
}

/// Counters for the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub requests: u64,
    pub skipped_silent: u64,
    pub failures: u64,
    pub average_processing_ms: u64,
}

pub struct TranscriptionSession {
    loader: Arc<dyn RecognizerLoader>,
    /// Held across the whole load, which is what serializes concurrent starts
    recognizer: Mutex<Option<Arc<dyn SpeechRecognizer>>>,
    state: RwLock<EngineState>,
    pool: Arc<Semaphore>,
    params: RwLock<RecognitionParams>,
    metrics: EngineMetrics,
}

impl TranscriptionSession {
    /// ## Parameters:
    /// - **loader**: builds the recognizer on first use
    /// - **params**: per-call configuration (bias list can be replaced later)
    /// - **workers**: size of the worker pool, at least 1
    pub fn new(loader: Arc<dyn RecognizerLoader>, params: RecognitionParams, workers: usize) -> Self {
        Self {
            loader,
            recognizer: Mutex::new(None),
            state: RwLock::new(EngineState::Idle),
            pool: Arc::new(Semaphore::new(workers.max(1))),
            params: RwLock::new(params),
            metrics: EngineMetrics::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn set_bias_phrases(&self, phrases: Vec<String>) {
        tracing::debug!("Recognizer bias list: {:?}", phrases);
        self.params.write().bias_phrases = phrases;
    }

    pub fn params(&self) -> RecognitionParams {
        self.params.read().clone()
    }

    /// Load the recognizer if it is not loaded yet.
    ///
    /// ## Errors:
    /// - `BotError::ModelLoad` when the loader fails (state goes back to `Idle`)
    /// - `BotError::Session` after `close`
    pub async fn ensure_loaded(&self) -> AppResult<Arc<dyn SpeechRecognizer>> {
        let mut slot = self.recognizer.lock().await;
        if let Some(recognizer) = slot.as_ref() {
            return Ok(recognizer.clone());
        }
        if self.state() == EngineState::Closed {
            return Err(BotError::Session("Transcription session is closed".to_string()));
        }

        *self.state.write() = EngineState::Loading;
        let start = Instant::now();
        let loaded = {
            let _permit = self
                .pool
                .acquire()
                .await
                .map_err(|_| BotError::ModelLoad("Worker pool closed".to_string()))?;
            self.loader.load().await
        };

        match loaded {
            Ok(recognizer) => {
                tracing::info!(
                    "Recognizer {} loaded in {:.2}s",
                    recognizer.name(),
                    start.elapsed().as_secs_f64()
                );
                *slot = Some(recognizer.clone());
                *self.state.write() = EngineState::Ready;
                Ok(recognizer)
            }
            Err(e) => {
                *self.state.write() = EngineState::Idle;
                tracing::error!("Failed to load recognizer: {:#}", e);
                Err(BotError::ModelLoad(format!("{:#}", e)))
            }
        }
    }

    /// Transcribe one chunk of target-rate audio.
    ///
    /// Empty or all-zero audio returns an empty transcript without loading or
    /// calling the recognizer.
    pub async fn transcribe(&self, audio: Vec<f32>, speaker_id: Option<u64>) -> AppResult<Transcript> {
        let timestamp = Utc::now();
        if is_silent(&audio) {
            self.metrics.skipped_silent.fetch_add(1, Ordering::Relaxed);
            return Ok(Transcript {
                text: String::new(),
                speaker_id,
                timestamp,
            });
        }

        let recognizer = self.ensure_loaded().await?;
        let params = self.params();
        let permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BotError::Session("Worker pool closed".to_string()))?;

        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let samples = audio.len();
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            recognizer.transcribe(&audio, &params)
        })
        .await;
        self.metrics
            .processing_ms
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);

        let segments = match result {
            Ok(Ok(segments)) => segments,
            Ok(Err(e)) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                return Err(BotError::Transcription(format!("{:#}", e)));
            }
            Err(e) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                return Err(BotError::Transcription(format!("Recognition task failed: {}", e)));
            }
        };

        let text = join_segments(&segments);
        tracing::debug!(
            "Transcribed {} samples in {}ms: {:?}",
            samples,
            start.elapsed().as_millis(),
            text
        );
        Ok(Transcript {
            text,
            speaker_id,
            timestamp,
        })
    }

    /// Drop the recognizer and refuse further work.
    pub async fn close(&self) {
        let mut slot = self.recognizer.lock().await;
        *slot = None;
        *self.state.write() = EngineState::Closed;
        tracing::info!("Transcription session closed");
    }

    pub fn stats(&self) -> EngineStats {
        let requests = self.metrics.requests.load(Ordering::Relaxed);
        let processing_ms = self.metrics.processing_ms.load(Ordering::Relaxed);
        EngineStats {
            requests,
            skipped_silent: self.metrics.skipped_silent.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            average_processing_ms: if requests > 0 { processing_ms / requests } else { 0 },
        }
    }
}

/// Trim each segment, drop empty ones and join with single spaces.
pub fn join_segments(segments: &[String]) -> String {
    segments
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
