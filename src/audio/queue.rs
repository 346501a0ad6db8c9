//! # Audio Ingest Queue
//!
//! Bounded FIFO between the voice transport and the session's processing loop.
//!
//! ## Contract:
//! - `push` never blocks and never fails: when full, the single oldest frame is
//!   dropped to make room for the new one
//! - `pop` suspends the consumer for at most `timeout` and then returns `None`
//! - `close` stops admission for good; frames still queued can be drained
//!
//! Dropped frames are counted for diagnostics, they are not errors.

use crate::error::{AppResult, BotError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One decoded 20ms-ish slice of speech from a single speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Speaker that produced this audio, if the transport could attribute it
    pub speaker_id: Option<u64>,
    /// Mono PCM16 little-endian bytes at the source sample rate
    pub pcm: Vec<u8>,
    /// Transport sequence number
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

impl AudioFrame {
    pub fn new(speaker_id: Option<u64>, pcm: Vec<u8>, sequence: u64) -> Self {
        Self {
            speaker_id,
            pcm,
            sequence,
            captured_at: Utc::now(),
        }
    }

    /// Reject payloads that cannot be PCM16: empty or odd byte length.
    pub fn validate(&self) -> AppResult<()> {
        if self.pcm.is_empty() {
            return Err(BotError::AudioValidation("empty PCM payload".to_string()));
        }
        if self.pcm.len() % 2 != 0 {
            return Err(BotError::AudioValidation(format!(
                "PCM payload has odd length {} (not 16-bit aligned)",
                self.pcm.len()
            )));
        }
        Ok(())
    }
}

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, after evicting the oldest frame
    DroppedOldest,
    /// Malformed frame, silently discarded
    Rejected,
    /// Admission already stopped
    Closed,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub dropped: u64,
    pub rejected: u64,
}

pub struct AudioIngestQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    pushed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl AudioIngestQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame without ever blocking the caller.
    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return PushOutcome::Closed;
        }
        if let Err(err) = frame.validate() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Dropping frame {}: {}", frame.sequence, err);
            return PushOutcome::Rejected;
        }

        let outcome = {
            let mut frames = self.frames.lock();
            let outcome = if frames.len() >= self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            frames.push_back(frame);
            outcome
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if outcome == PushOutcome::DroppedOldest {
            tracing::debug!("Audio queue full, dropped oldest frame");
        }
        // notify_one stores a permit when nobody is waiting, so a pop that
        // starts after this push still wakes up immediately
        self.notify.notify_one();
        outcome
    }

    /// Wait up to `timeout` for the next frame.
    pub async fn pop(&self, timeout: Duration) -> Option<AudioFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                // One last look: a push may have landed right at the deadline
                return self.try_pop();
            }
        }
    }

    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.frames.lock().pop_front()
    }

    /// Stop admitting frames. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<AudioFrame> {
        self.frames.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.len(),
            capacity: self.capacity,
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::new(Some(7), vec![0u8; 4], seq)
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = AudioIngestQueue::new(3);
        for seq in 0..3 {
            assert_eq!(queue.push(frame(seq)), PushOutcome::Queued);
        }
        assert_eq!(queue.push(frame(3)), PushOutcome::DroppedOldest);
        assert_eq!(queue.len(), 3);

        let remaining: Vec<u64> = queue.drain().iter().map(|f| f.sequence).collect();
        assert_eq!(remaining, vec![1, 2, 3]);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let queue = AudioIngestQueue::new(5);
        for seq in 0..100 {
            queue.push(frame(seq));
            assert!(queue.len() <= 5);
        }
        assert_eq!(queue.stats().dropped, 95);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        let queue = AudioIngestQueue::new(4);
        assert_eq!(queue.push(AudioFrame::new(None, vec![], 0)), PushOutcome::Rejected);
        assert_eq!(queue.push(AudioFrame::new(None, vec![1, 2, 3], 1)), PushOutcome::Rejected);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().rejected, 2);
    }

    #[test]
    fn test_closed_queue_refuses_frames() {
        let queue = AudioIngestQueue::new(4);
        queue.push(frame(0));
        queue.close();
        assert_eq!(queue.push(frame(1)), PushOutcome::Closed);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out_without_data() {
        let queue = AudioIngestQueue::new(4);
        let started = Instant::now();
        assert!(queue.pop(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(AudioIngestQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.push(frame(42));
        let popped = consumer.await.unwrap();
        assert_eq!(popped.map(|f| f.sequence), Some(42));
    }
}
