//! # Application State
//!
//! Everything the pipeline shares, built once at startup and handed to each
//! component explicitly.
//!
//! ## Sharing pattern:
//! - **Arc**: sessions, the dispatcher and the CLI all hold the same context
//! - **RwLock**: the vocabulary and the detector built from it are read on
//!   every transcript and written only by `vocab add/remove`
//! - **async Mutex**: the command synthesizer owns the remote connection and
//!   the cooldown map; only one operation talks to the server at a time
//! - **Atomics**: metrics are bumped from the hot path without locking

use crate::audio::queue::PushOutcome;
use crate::commands::rcon::RemoteConsole;
use crate::commands::synthesizer::{CommandSynthesizer, SynthesizerSettings};
use crate::config::AppConfig;
use crate::detection::{PhraseDetector, RadiusPolicy, Vocabulary, VocabularyEntry};
use crate::error::AppResult;
use crate::transcription::engine::{RecognitionParams, RecognizerLoader, Transcript, TranscriptionSession};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Pipeline counters since startup.
///
/// ## Why these metrics matter:
/// - **frames_dropped**: the consumer is falling behind the voice channel
/// - **empty_transcripts**: the recognizer hears nothing (gain or VAD too strict)
/// - **detections** vs **triggered_operations**: how often vocabulary words
///   come up without the trigger phrase
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    frames_rejected: AtomicU64,
    chunks_dispatched: AtomicU64,
    transcripts: AtomicU64,
    empty_transcripts: AtomicU64,
    detections: AtomicU64,
    triggered_operations: AtomicU64,
    processing_errors: AtomicU64,
}

/// Point-in-time copy of `PipelineMetrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_rejected: u64,
    pub chunks_dispatched: u64,
    pub transcripts: u64,
    pub empty_transcripts: u64,
    pub detections: u64,
    pub triggered_operations: u64,
    pub processing_errors: u64,
}

impl PipelineMetrics {
    pub fn record_push(&self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Queued => {
                self.frames_received.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::DroppedOldest => {
                self.frames_received.fetch_add(1, Ordering::Relaxed);
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Rejected | PushOutcome::Closed => {
                self.frames_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_dispatched(&self) {
        self.chunks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transcript(&self, transcript: &Transcript) {
        if transcript.is_empty() {
            self.empty_transcripts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transcripts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_triggered_operation(&self) {
        self.triggered_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
            transcripts: self.transcripts.load(Ordering::Relaxed),
            empty_transcripts: self.empty_transcripts.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            triggered_operations: self.triggered_operations.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Shared dependencies of every session and command.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    vocabulary: Arc<RwLock<Vocabulary>>,
    /// Rebuilt whenever the vocabulary changes; readers clone the inner Arc
    detector: Arc<RwLock<Arc<PhraseDetector>>>,
    pub synthesizer: Arc<tokio::sync::Mutex<CommandSynthesizer>>,
    pub transcription: Arc<TranscriptionSession>,
    pub metrics: Arc<PipelineMetrics>,
    pub start_time: Instant,
}

impl AppContext {
    /// Wire the components together.
    ///
    /// ## Parameters:
    /// - **config**: validated configuration
    /// - **vocabulary**: phrase table, usually from `Vocabulary::load_or_create`
    /// - **console**: remote console the synthesizer drives
    /// - **loader**: recognizer factory, invoked on the first transcription
    pub fn new(
        config: AppConfig,
        vocabulary: Vocabulary,
        console: Box<dyn RemoteConsole>,
        loader: Arc<dyn RecognizerLoader>,
    ) -> Self {
        let detector = build_detector(&config, &vocabulary);
        let params = RecognitionParams::from_config(&config.recognizer, config.audio.target_sample_rate);
        let transcription = TranscriptionSession::new(loader, params, config.recognizer.worker_threads);
        transcription.set_bias_phrases(detector.bias_list());
        let synthesizer = CommandSynthesizer::new(console, SynthesizerSettings::from(&config.commands));

        Self {
            config: Arc::new(config),
            vocabulary: Arc::new(RwLock::new(vocabulary)),
            detector: Arc::new(RwLock::new(Arc::new(detector))),
            synthesizer: Arc::new(tokio::sync::Mutex::new(synthesizer)),
            transcription: Arc::new(transcription),
            metrics: Arc::new(PipelineMetrics::default()),
            start_time: Instant::now(),
        }
    }

    /// Current detector. Cheap; holds no lock after returning.
    pub fn detector(&self) -> Arc<PhraseDetector> {
        self.detector.read().clone()
    }

    pub fn vocabulary_entries(&self) -> Vec<VocabularyEntry> {
        self.vocabulary.read().entries().to_vec()
    }

    /// Add or replace a phrase, persist it and refresh the detector and bias list.
    pub fn add_vocabulary(&self, phrase: &str, block_id: &str) -> AppResult<(String, String)> {
        let added = self.vocabulary.write().add(phrase, block_id)?;
        self.refresh_detector();
        Ok(added)
    }

    /// Remove a phrase. Returns false when it was not in the vocabulary.
    pub fn remove_vocabulary(&self, phrase: &str) -> AppResult<bool> {
        let removed = self.vocabulary.write().remove(phrase)?;
        if removed {
            self.refresh_detector();
        }
        Ok(removed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn refresh_detector(&self) {
        let detector = build_detector(&self.config, &self.vocabulary.read());
        self.transcription.set_bias_phrases(detector.bias_list());
        *self.detector.write() = Arc::new(detector);
    }
}

fn build_detector(config: &AppConfig, vocabulary: &Vocabulary) -> PhraseDetector {
    PhraseDetector::new(
        vocabulary,
        &config.commands.trigger_phrase,
        RadiusPolicy {
            default_radius: config.commands.default_radius,
            max_radius: config.commands.max_radius,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeConsole, FakeLoader};

    fn context(vocabulary: Vocabulary) -> (AppContext, crate::test_helpers::RecognizerCalls) {
        let loader = FakeLoader::replying(&["ok"]);
        let calls = loader.calls();
        let ctx = AppContext::new(
            AppConfig::default(),
            vocabulary,
            Box::new(FakeConsole::with_players(&[])),
            Arc::new(loader),
        );
        (ctx, calls)
    }

    #[test]
    fn test_push_outcomes_are_counted() {
        let metrics = PipelineMetrics::default();
        metrics.record_push(PushOutcome::Queued);
        metrics.record_push(PushOutcome::DroppedOldest);
        metrics.record_push(PushOutcome::Rejected);
        metrics.record_push(PushOutcome::Closed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.frames_rejected, 2);
    }

    #[test]
    fn test_transcripts_split_by_emptiness() {
        let metrics = PipelineMetrics::default();
        let transcript = |text: &str| Transcript {
            text: text.to_string(),
            speaker_id: None,
            timestamp: chrono::Utc::now(),
        };
        metrics.record_transcript(&transcript(""));
        metrics.record_transcript(&transcript("clear chunk stone"));
        metrics.record_transcript(&transcript(""));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transcripts, 1);
        assert_eq!(snapshot.empty_transcripts, 2);
    }

    #[tokio::test]
    async fn test_vocabulary_changes_rebuild_detector_and_bias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.json");
        let (ctx, calls) = context(Vocabulary::load_or_create(&path).unwrap());

        assert!(ctx.detector().detect("clear chunk sand", None).is_none());
        let (phrase, block) = ctx.add_vocabulary("Sand!", "sand").unwrap();
        assert_eq!((phrase.as_str(), block.as_str()), ("sand", "minecraft:sand"));
        assert_eq!(
            ctx.detector().detect("clear chunk sand", None).unwrap().block_id,
            "minecraft:sand"
        );

        // New phrase reaches the recognizer's bias list
        ctx.transcription.transcribe(vec![0.1; 10], None).await.unwrap();
        assert!(calls.last_bias().contains(&"sand".to_string()));

        assert!(ctx.remove_vocabulary("sand").unwrap());
        assert!(!ctx.remove_vocabulary("sand").unwrap());
        assert!(ctx.detector().detect("clear chunk sand", None).is_none());

        // Persisted: a fresh load sees the defaults only
        let reloaded = Vocabulary::load_or_create(&path).unwrap();
        assert_eq!(reloaded.len(), Vocabulary::default_entries().len());
    }

    #[test]
    fn test_initial_bias_list() {
        let (ctx, _) = context(Vocabulary::from_pairs([("grass", "minecraft:grass_block")]));
        assert_eq!(
            ctx.transcription.params().bias_phrases,
            vec!["grass".to_string(), "clear".to_string(), "chunk".to_string()]
        );
    }
}
