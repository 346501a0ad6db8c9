//! # Chunk Accumulation
//!
//! Collects raw PCM bytes from one speaker until enough audio for a
//! recognition pass has arrived, then slices it into fixed-size chunks.
//!
//! ## Key Features:
//! - **Fixed chunk size**: `source_rate * chunk_seconds * 2` bytes (3s at 48kHz = 288,000 bytes)
//! - **No lost audio**: bytes past a chunk boundary stay buffered for the next chunk
//! - **Catch-up**: every complete chunk present after an append is emitted at once
//! - **Flush on stop**: the leftover tail can be taken as a final, shorter chunk

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sizing for a chunk accumulator.
///
/// ## Example:
/// For 3 second chunks at 48kHz: 48000 * 3 * 2 = 288,000 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Sample rate of the incoming bytes
    pub sample_rate: u32,

    /// Duration of one emitted chunk
    pub chunk_seconds: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            chunk_seconds: 3,
        }
    }
}

impl ChunkConfig {
    pub fn chunk_bytes(&self) -> usize {
        self.sample_rate as usize * self.chunk_seconds as usize * BYTES_PER_SAMPLE
    }
}

/// Byte accumulator for a single speaker stream.
///
/// Owned by the processing loop, so no locking is needed: only the loop
/// appends and only the loop drains.
#[derive(Debug)]
pub struct ChunkAccumulator {
    buffer: Vec<u8>,
    chunk_bytes: usize,
}

impl ChunkAccumulator {
    pub fn new(config: ChunkConfig) -> Self {
        let chunk_bytes = config.chunk_bytes().max(BYTES_PER_SAMPLE);
        Self {
            buffer: Vec::with_capacity(chunk_bytes),
            chunk_bytes,
        }
    }

    /// Append bytes and return every complete chunk now available.
    ///
    /// ## Returns:
    /// Zero or more chunks of exactly `chunk_bytes` each, oldest first.
    /// Whatever does not fill a whole chunk stays buffered.
    pub fn append(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);

        let complete = self.buffer.len() / self.chunk_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let consumed = complete * self.chunk_bytes;
        let chunks = self.buffer[..consumed]
            .chunks_exact(self.chunk_bytes)
            .map(<[u8]>::to_vec)
            .collect();
        self.buffer.drain(..consumed);
        chunks
    }

    /// Take whatever is buffered as a final, possibly short, chunk.
    ///
    /// Returns `None` when there is nothing to flush. A trailing odd byte
    /// cannot form a sample and is discarded.
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        let usable = self.buffer.len() - self.buffer.len() % BYTES_PER_SAMPLE;
        let remainder: Vec<u8> = self.buffer.drain(..).take(usable).collect();
        if remainder.is_empty() {
            None
        } else {
            Some(remainder)
        }
    }

    /// Number of bytes waiting for the next chunk boundary.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }
}
