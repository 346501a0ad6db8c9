//! # Processing Pipeline
//!
//! The per-session loop that moves audio from the ingest queue to the server:
//!
//! ```text
//! queue --pop--> per-speaker ChunkAccumulator --chunk--> Resampler
//!   --spawn--> TranscriptionSession --text--> TranscriptDispatcher --> CommandSynthesizer
//! ```
//!
//! Recognition runs in a `JoinSet` owned by the loop. The loop never waits on a
//! chunk it dispatched; finished tasks are reaped between pops, so results can
//! arrive out of order.

use crate::audio::buffer::{ChunkAccumulator, ChunkConfig};
use crate::audio::processor::{ChunkRecorder, Resampler};
use crate::audio::queue::{AudioFrame, AudioIngestQueue};
use crate::commands::synthesizer::{CooldownKey, Gated, PlayerResults};
use crate::config::AudioConfig;
use crate::detection::{is_namespaced_block, DetectionResult};
use crate::error::{AppResult, BotError};
use crate::state::{AppContext, PipelineMetrics};
use crate::transcription::engine::Transcript;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Target-rate audio for one speaker, ready for recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedChunk {
    pub speaker_id: Option<u64>,
    pub samples: Vec<f32>,
}

/// Per-speaker accumulation and resampling.
///
/// Owned by exactly one loop at a time, so no locking.
pub struct ChunkPipeline {
    chunk_config: ChunkConfig,
    accumulators: HashMap<Option<u64>, ChunkAccumulator>,
    resampler: Resampler,
    gain: f32,
    recorder: Option<ChunkRecorder>,
    recorded: u64,
}

impl ChunkPipeline {
    pub fn new(config: &AudioConfig, recorder: Option<ChunkRecorder>) -> AppResult<Self> {
        Ok(Self {
            chunk_config: ChunkConfig {
                sample_rate: config.source_sample_rate,
                chunk_seconds: config.chunk_seconds,
            },
            accumulators: HashMap::new(),
            resampler: Resampler::new(config.source_sample_rate, config.target_sample_rate)?,
            gain: config.input_gain,
            recorder,
            recorded: 0,
        })
    }

    /// Buffer a frame and return every chunk it completed.
    pub fn push_frame(&mut self, frame: &AudioFrame) -> Vec<PreparedChunk> {
        let config = self.chunk_config;
        let raw = self
            .accumulators
            .entry(frame.speaker_id)
            .or_insert_with(|| ChunkAccumulator::new(config))
            .append(&frame.pcm);

        raw.into_iter()
            .map(|pcm| self.prepare(frame.speaker_id, &pcm))
            .collect()
    }

    /// Take every speaker's partial chunk. Leaves the pipeline empty.
    pub fn flush(&mut self) -> Vec<PreparedChunk> {
        let mut remainders: Vec<(Option<u64>, Vec<u8>)> = self
            .accumulators
            .iter_mut()
            .filter_map(|(&speaker, acc)| acc.take_remainder().map(|pcm| (speaker, pcm)))
            .collect();
        remainders.sort_by_key(|(speaker, _)| *speaker);
        self.accumulators.clear();

        remainders
            .into_iter()
            .map(|(speaker, pcm)| self.prepare(speaker, &pcm))
            .collect()
    }

    /// Bytes waiting across all speakers.
    pub fn buffered(&self) -> usize {
        self.accumulators.values().map(|a| a.buffered()).sum()
    }

    fn prepare(&mut self, speaker_id: Option<u64>, pcm: &[u8]) -> PreparedChunk {
        if let Some(recorder) = &self.recorder {
            match recorder.record(speaker_id, self.recorded, pcm) {
                Ok(path) => tracing::debug!("Saved chunk to {}", path.display()),
                Err(e) => tracing::warn!("Failed to save chunk: {}", e),
            }
            self.recorded += 1;
        }
        PreparedChunk {
            speaker_id,
            samples: self.resampler.process(pcm, self.gain),
        }
    }
}

/// What the dispatcher did with a transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Empty text or no vocabulary phrase
    Ignored,
    /// A phrase without the trigger phrase
    NotTriggered(DetectionResult),
    /// The phrase maps to something outside the `minecraft:` namespace
    InvalidBlock(DetectionResult),
    CooledDown {
        detection: DetectionResult,
        remaining: Duration,
    },
    Executed {
        detection: DetectionResult,
        results: PlayerResults,
    },
}

/// Decides whether a transcript becomes a world edit, and runs it.
#[derive(Clone)]
pub struct TranscriptDispatcher {
    ctx: AppContext,
}

impl TranscriptDispatcher {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn dispatch(&self, transcript: &Transcript) -> AppResult<Dispatch> {
        if transcript.is_empty() {
            return Ok(Dispatch::Ignored);
        }
        tracing::info!("Heard: {:?} (speaker {:?})", transcript.text, transcript.speaker_id);

        let detector = self.ctx.detector();
        let Some(detection) = detector.detect(&transcript.text, transcript.speaker_id) else {
            return Ok(Dispatch::Ignored);
        };
        self.ctx.metrics.record_detection();

        if !detector.has_trigger(&transcript.text) {
            tracing::debug!("'{}' heard without '{}'", detection.matched_phrase, detector.trigger_phrase());
            return Ok(Dispatch::NotTriggered(detection));
        }
        if !is_namespaced_block(&detection.block_id) {
            tracing::error!("Invalid block id for '{}': {}", detection.matched_phrase, detection.block_id);
            return Ok(Dispatch::InvalidBlock(detection));
        }

        let key = CooldownKey::for_speaker(detection.speaker_id, self.ctx.config.commands.per_speaker_cooldown);
        let outcome = self
            .ctx
            .synthesizer
            .lock()
            .await
            .clear_around_all_players(&detection.block_id, key)
            .await?;

        match outcome {
            Gated::Ran(results) => {
                self.ctx.metrics.record_triggered_operation();
                let failed: Vec<&str> = results
                    .iter()
                    .filter(|(_, &ok)| !ok)
                    .map(|(player, _)| player.as_str())
                    .collect();
                if failed.is_empty() {
                    tracing::info!("Cleared {} for {} player(s)", detection.block_id, results.len());
                } else {
                    tracing::warn!("Clearing {} failed for: {}", detection.block_id, failed.join(", "));
                }
                Ok(Dispatch::Executed { detection, results })
            }
            Gated::CooledDown { remaining } => Ok(Dispatch::CooledDown { detection, remaining }),
        }
    }
}

/// Recognize one chunk and act on the text.
///
/// Recognition errors are returned so the loop can count them; a failed world
/// edit is logged here and does not count against the loop.
pub async fn process_chunk(
    ctx: AppContext,
    dispatcher: TranscriptDispatcher,
    chunk: PreparedChunk,
) -> AppResult<Transcript> {
    let transcript = ctx.transcription.transcribe(chunk.samples, chunk.speaker_id).await?;
    ctx.metrics.record_transcript(&transcript);

    if let Err(e) = dispatcher.dispatch(&transcript).await {
        ctx.metrics.record_processing_error();
        tracing::error!("Failed to act on {:?}: {}", transcript.text, e);
    }
    Ok(transcript)
}

/// State handed back by the ingestion loop when it exits.
pub struct LoopOutput {
    pub chunker: ChunkPipeline,
    /// Recognition tasks still running
    pub tasks: JoinSet<AppResult<Transcript>>,
    /// Set when the loop stopped itself
    pub failure: Option<BotError>,
}

/// Loop knobs, from the `audio` config section.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub pop_timeout: Duration,
    pub max_consecutive_errors: u32,
}

impl From<&AudioConfig> for LoopSettings {
    fn from(config: &AudioConfig) -> Self {
        Self {
            pop_timeout: Duration::from_millis(config.pop_timeout_ms),
            max_consecutive_errors: config.max_consecutive_errors.max(1),
        }
    }
}

/// Consecutive failures of finished recognition tasks.
struct ErrorBreaker {
    consecutive: u32,
    limit: u32,
    metrics: Arc<PipelineMetrics>,
}

impl ErrorBreaker {
    /// Returns the error that should stop the loop, if any.
    fn observe(&mut self, result: Result<AppResult<Transcript>, tokio::task::JoinError>) -> Option<BotError> {
        let error = match result {
            Ok(Ok(_)) => {
                self.consecutive = 0;
                return None;
            }
            Ok(Err(e)) => e,
            Err(e) if e.is_cancelled() => return None,
            Err(e) => BotError::Transcription(format!("Recognition task panicked: {}", e)),
        };

        tracing::error!("Error processing audio chunk: {}", error);
        self.metrics.record_processing_error();
        if error.is_fatal() {
            return Some(error);
        }
        self.consecutive += 1;
        if self.consecutive >= self.limit {
            tracing::error!(
                "Too many consecutive errors ({}), stopping audio processing",
                self.consecutive
            );
            return Some(error);
        }
        None
    }
}

/// Pop frames until cancelled, dispatching every completed chunk.
pub async fn run_ingestion_loop(
    ctx: AppContext,
    queue: Arc<AudioIngestQueue>,
    mut chunker: ChunkPipeline,
    settings: LoopSettings,
    cancel: CancellationToken,
) -> LoopOutput {
    let dispatcher = TranscriptDispatcher::new(ctx.clone());
    let mut tasks: JoinSet<AppResult<Transcript>> = JoinSet::new();
    let mut breaker = ErrorBreaker {
        consecutive: 0,
        limit: settings.max_consecutive_errors,
        metrics: ctx.metrics.clone(),
    };
    let mut failure = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(error) = breaker.observe(joined) {
                    // Nobody drains the queue past this point
                    queue.close();
                    failure = Some(error);
                    break;
                }
            }
            frame = queue.pop(settings.pop_timeout) => {
                let Some(frame) = frame else { continue };
                for chunk in chunker.push_frame(&frame) {
                    ctx.metrics.record_chunk_dispatched();
                    tasks.spawn(process_chunk(ctx.clone(), dispatcher.clone(), chunk));
                }
            }
        }
    }

    LoopOutput { chunker, tasks, failure }
}
