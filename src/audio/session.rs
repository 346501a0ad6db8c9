//! # Channel Sessions
//!
//! One session per voice channel: its ingest queue, the processing loop that
//! drains it, and that loop's in-flight recognition tasks.
//!
//! ## Session Lifecycle:
//! ```text
//! Idle --start--> Capturing --stop--> Transcribing --> Closed
//! Capturing --too many errors--> Failed --stop--> Transcribing --> Closed
//! ```
//! `start` waits for the recognizer to load, so a session never captures audio
//! it cannot transcribe.
//!
//! ## Stop ordering:
//! 1. Close the queue (no new frames admitted)
//! 2. Cancel the processing loop and wait for it to hand back its buffers
//! 3. Wait for every recognition task it dispatched
//! 4. Transcribe each speaker's partial chunk, one at a time
//! 5. Release the session

use crate::audio::ingest::{FrameDecoder, FrameIngestor};
use crate::audio::processor::ChunkRecorder;
use crate::audio::queue::{AudioFrame, AudioIngestQueue, PushOutcome, QueueStats};
use crate::error::{AppResult, BotError};
use crate::pipeline::{process_chunk, run_ingestion_loop, ChunkPipeline, LoopOutput, LoopSettings, TranscriptDispatcher};
use crate::state::AppContext;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Capturing,
    Transcribing,
    Closed,
    /// The processing loop stopped itself; admission is closed until `stop`
    Failed,
}

/// Status report for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub channel_id: u64,
    pub session_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub queued_frames: usize,
    pub dropped_frames: u64,
}

/// What `stop` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopSummary {
    /// Recognition tasks still running when the loop stopped
    pub tasks_joined: usize,
    /// Partial chunks transcribed during teardown
    pub remainders_flushed: usize,
    /// Frames left in the queue, never processed
    pub frames_discarded: usize,
}

pub struct Session {
    channel_id: u64,
    session_id: Uuid,
    ctx: AppContext,
    queue: Arc<AudioIngestQueue>,
    state: Arc<RwLock<SessionState>>,
    cancel: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<LoopOutput>>>,
    started_at: DateTime<Utc>,
}

impl Session {
    fn new(channel_id: u64, ctx: AppContext) -> Self {
        let queue = Arc::new(AudioIngestQueue::new(ctx.config.audio.queue_capacity));
        Self {
            channel_id,
            session_id: Uuid::new_v4(),
            ctx,
            queue,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            cancel: CancellationToken::new(),
            worker: tokio::sync::Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    /// Spawn the processing loop.
    async fn launch(&self) -> AppResult<()> {
        let recorder = match &self.ctx.config.audio.save_audio_dir {
            Some(dir) => {
                let dir = dir.join(self.session_id.to_string());
                match ChunkRecorder::new(&dir, self.ctx.config.audio.source_sample_rate) {
                    Ok(recorder) => {
                        tracing::info!("Saving audio chunks to {}", dir.display());
                        Some(recorder)
                    }
                    Err(e) => {
                        tracing::warn!("Cannot save audio chunks to {}: {}", dir.display(), e);
                        None
                    }
                }
            }
            None => None,
        };
        let chunker = ChunkPipeline::new(&self.ctx.config.audio, recorder)?;

        *self.state.write() = SessionState::Capturing;
        let processing = run_ingestion_loop(
            self.ctx.clone(),
            self.queue.clone(),
            chunker,
            LoopSettings::from(&self.ctx.config.audio),
            self.cancel.clone(),
        );
        let state = self.state.clone();
        let channel_id = self.channel_id;
        let handle = tokio::spawn(async move {
            let output = processing.await;
            if let Some(error) = &output.failure {
                *state.write() = SessionState::Failed;
                tracing::error!("Processing for channel {} stopped: {}", channel_id, error);
            }
            output
        });
        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Hand one decoded frame to the session. Never blocks.
    pub fn ingest(&self, frame: AudioFrame) -> PushOutcome {
        let outcome = self.queue.push(frame);
        self.ctx.metrics.record_push(outcome);
        outcome
    }

    /// Decode a transport packet with `ingestor` and queue it.
    pub fn ingest_packet<D: FrameDecoder>(&self, ingestor: &mut FrameIngestor<D>, packet: &[u8]) -> PushOutcome {
        ingestor.ingest(packet, &self.queue, &self.ctx.metrics)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn status(&self) -> SessionStatus {
        let stats = self.queue.stats();
        SessionStatus {
            channel_id: self.channel_id,
            session_id: self.session_id.to_string(),
            state: self.state(),
            started_at: self.started_at,
            queued_frames: stats.len,
            dropped_frames: stats.dropped,
        }
    }

    /// Tear the session down in order. A second call does nothing.
    pub async fn stop(&self) -> AppResult<StopSummary> {
        self.queue.close();
        self.cancel.cancel();
        let Some(handle) = self.worker.lock().await.take() else {
            return Ok(StopSummary::default());
        };

        let LoopOutput { mut chunker, mut tasks, failure } = handle
            .await
            .map_err(|e| BotError::Session(format!("Processing loop for channel {} failed: {}", self.channel_id, e)))?;
        if let Some(error) = failure {
            tracing::warn!("Processing loop for channel {} had stopped itself: {}", self.channel_id, error);
        }
        *self.state.write() = SessionState::Transcribing;

        let mut summary = StopSummary::default();
        while let Some(joined) = tasks.join_next().await {
            summary.tasks_joined += 1;
            let error = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            self.ctx.metrics.record_processing_error();
            tracing::warn!("Recognition task failed during stop: {}", error);
        }

        summary.frames_discarded = self.queue.drain().len();
        if summary.frames_discarded > 0 {
            tracing::warn!(
                "Discarded {} queued frame(s) for channel {}",
                summary.frames_discarded,
                self.channel_id
            );
        }

        let dispatcher = TranscriptDispatcher::new(self.ctx.clone());
        for chunk in chunker.flush() {
            summary.remainders_flushed += 1;
            self.ctx.metrics.record_chunk_dispatched();
            if let Err(e) = process_chunk(self.ctx.clone(), dispatcher.clone(), chunk).await {
                self.ctx.metrics.record_processing_error();
                tracing::warn!("Failed to transcribe remainder: {}", e);
            }
        }

        *self.state.write() = SessionState::Closed;
        tracing::info!(
            "Session {} for channel {} closed ({} task(s) joined, {} remainder(s) flushed)",
            self.session_id,
            self.channel_id,
            summary.tasks_joined,
            summary.remainders_flushed
        );
        Ok(summary)
    }
}

/// Active sessions keyed by channel id.
pub struct SessionRegistry {
    ctx: AppContext,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(ctx: AppContext) -> Self {
        let max_sessions = ctx.config.sessions.max_sessions;
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Start capturing for `channel_id`.
    ///
    /// ## Errors:
    /// - `BotError::Session` when the channel already has a session or the
    ///   registry is full
    /// - `BotError::ModelLoad` when the recognizer cannot be loaded
    pub async fn start(&self, channel_id: u64) -> AppResult<Arc<Session>> {
        Self::check_capacity(&self.sessions.read(), channel_id, self.max_sessions)?;
        self.ctx.transcription.ensure_loaded().await?;

        let session = Arc::new(Session::new(channel_id, self.ctx.clone()));
        {
            // Re-checked under the write guard: another start may have finished
            // while the model loaded
            let mut sessions = self.sessions.write();
            Self::check_capacity(&sessions, channel_id, self.max_sessions)?;
            sessions.insert(channel_id, session.clone());
        }
        if let Err(e) = session.launch().await {
            self.sessions.write().remove(&channel_id);
            return Err(e);
        }

        tracing::info!("Session {} started for channel {}", session.session_id(), channel_id);
        Ok(session)
    }

    pub fn get(&self, channel_id: u64) -> Option<Arc<Session>> {
        self.sessions.read().get(&channel_id).cloned()
    }

    /// Stop and forget the session for `channel_id`.
    pub async fn stop(&self, channel_id: u64) -> AppResult<StopSummary> {
        let session = self
            .sessions
            .write()
            .remove(&channel_id)
            .ok_or_else(|| BotError::Session(format!("No session for channel {}", channel_id)))?;
        session.stop().await
    }

    /// Stop every session, logging failures.
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = session.stop().await {
                tracing::error!("Failed to stop session for channel {}: {}", session.channel_id(), e);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = self.sessions.read().values().map(|s| s.status()).collect();
        statuses.sort_by_key(|s| s.channel_id);
        statuses
    }

    fn check_capacity(sessions: &HashMap<u64, Arc<Session>>, channel_id: u64, max_sessions: usize) -> AppResult<()> {
        if sessions.contains_key(&channel_id) {
            return Err(BotError::Session(format!("Channel {} already has a session", channel_id)));
        }
        if sessions.len() >= max_sessions {
            return Err(BotError::Session(format!(
                "Maximum concurrent sessions ({}) reached",
                max_sessions
            )));
        }
        Ok(())
    }
}
