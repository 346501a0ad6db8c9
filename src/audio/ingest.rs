//! # Ingestion Boundary
//!
//! Adapts the voice transport's packets into `AudioFrame`s for a session queue.
//!
//! The transport hands us encoded packets per speaker. A `FrameDecoder` turns
//! them into PCM16. Decoders fail on corrupt packets now and then; wrapping
//! one in `SilenceOnError` replaces a failed packet with 20ms of silence so
//! the stream keeps its timing and the chunk boundaries stay aligned.

use crate::audio::queue::{AudioFrame, AudioIngestQueue, PushOutcome};
use crate::state::PipelineMetrics;

/// Samples in one 20ms frame at 48kHz.
pub const SILENCE_FRAME_SAMPLES: usize = 960;

/// Decodes one transport packet into mono PCM16 little-endian bytes.
pub trait FrameDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Decoder wrapper that substitutes silence for packets that fail to decode.
pub struct SilenceOnError<D> {
    inner: D,
    silence: Vec<u8>,
    failures: u64,
}

impl<D: FrameDecoder> SilenceOnError<D> {
    pub fn new(inner: D) -> Self {
        Self::with_frame_samples(inner, SILENCE_FRAME_SAMPLES)
    }

    pub fn with_frame_samples(inner: D, samples: usize) -> Self {
        Self {
            inner,
            silence: vec![0u8; samples * 2],
            failures: 0,
        }
    }

    /// Packets replaced with silence so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: FrameDecoder> FrameDecoder for SilenceOnError<D> {
    fn decode(&mut self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        match self.inner.decode(packet) {
            Ok(pcm) => Ok(pcm),
            Err(e) => {
                self.failures += 1;
                tracing::warn!("Packet decode failed, substituting silence: {}", e);
                Ok(self.silence.clone())
            }
        }
    }
}

/// Identity decoder for transports that already deliver PCM16.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmPassthrough;

impl FrameDecoder for PcmPassthrough {
    fn decode(&mut self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(packet.to_vec())
    }
}

/// Feeds decoded frames for one speaker stream into a session queue.
pub struct FrameIngestor<D> {
    decoder: D,
    speaker_id: Option<u64>,
    sequence: u64,
}

impl<D: FrameDecoder> FrameIngestor<D> {
    pub fn new(decoder: D, speaker_id: Option<u64>) -> Self {
        Self {
            decoder,
            speaker_id,
            sequence: 0,
        }
    }

    /// Decode one packet and push it. Never blocks, never fails.
    ///
    /// A decoder error without a `SilenceOnError` wrapper drops the packet.
    pub fn ingest(
        &mut self,
        packet: &[u8],
        queue: &AudioIngestQueue,
        metrics: &PipelineMetrics,
    ) -> PushOutcome {
        let pcm = match self.decoder.decode(packet) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::debug!("Dropping undecodable packet: {}", e);
                metrics.record_frame_rejected();
                return PushOutcome::Rejected;
            }
        };

        let frame = AudioFrame::new(self.speaker_id, pcm, self.sequence);
        self.sequence += 1;

        let outcome = queue.push(frame);
        metrics.record_push(outcome);
        outcome
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }
}
