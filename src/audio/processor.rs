//! # Audio Processing
//!
//! Converts accumulated source-rate chunks into what the recognizer wants:
//! mono f32 samples at the target rate in `[-1.0, 1.0]`.
//!
//! ## Key Functions:
//! - **Decimation**: keep every N-th sample, where N = source rate / target rate
//! - **Format conversion**: PCM16 to f32 with input gain and clamping
//! - **Chunk recording**: optionally write each chunk to disk as a WAV file
//!
//! ## Known limitation:
//! Decimation carries no phase between chunks and applies no low-pass filter.
//! Every chunk restarts at its first sample. With whole chunks of
//! `rate * seconds` samples the phase is always aligned anyway; only the
//! final flushed remainder can be off by up to N-1 samples.

use crate::error::{AppResult, BotError};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::{self, File};
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

/// Integer-ratio downsampler for PCM16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resampler {
    source_rate: u32,
    target_rate: u32,
    ratio: usize,
}

impl Resampler {
    /// Build a resampler for `source_rate -> target_rate`.
    ///
    /// ## Errors:
    /// `BotError::Config` when either rate is zero or the ratio is not an integer.
    pub fn new(source_rate: u32, target_rate: u32) -> AppResult<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(BotError::Config("Sample rates must be non-zero".to_string()));
        }
        if source_rate < target_rate || source_rate % target_rate != 0 {
            return Err(BotError::Config(format!(
                "Cannot decimate {}Hz to {}Hz: ratio is not an integer",
                source_rate, target_rate
            )));
        }
        Ok(Self {
            source_rate,
            target_rate,
            ratio: (source_rate / target_rate) as usize,
        })
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Decimate little-endian PCM16 bytes, keeping samples 0, N, 2N, ...
    pub fn decimate(&self, pcm: &[u8]) -> Vec<i16> {
        let samples = read_pcm16(pcm);
        samples.into_iter().step_by(self.ratio).collect()
    }

    /// Decimate and convert to recognizer input in one step.
    pub fn process(&self, pcm: &[u8], gain: f32) -> Vec<f32> {
        pcm_to_float(&self.decimate(pcm), gain)
    }
}

/// Parse little-endian PCM16 bytes; a trailing odd byte is ignored.
pub fn read_pcm16(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Convert PCM16 samples to f32 in `[-1.0, 1.0]`, scaled by `gain`.
///
/// ## Conversion:
/// `sample / 32768 * gain`, clamped so loud input saturates instead of wrapping.
pub fn pcm_to_float(samples: &[i16], gain: f32) -> Vec<f32> {
    samples
        .iter()
        .map(|&sample| (sample as f32 / 32768.0 * gain).clamp(-1.0, 1.0))
        .collect()
}

/// Root mean square level of a float signal.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// True when the chunk has no audible content at all.
pub fn is_silent(samples: &[f32]) -> bool {
    samples.iter().all(|&s| s == 0.0)
}

/// Writes emitted chunks to a directory as mono 16-bit WAV files.
///
/// Recording is diagnostics only. Callers log failures and move on.
#[derive(Debug, Clone)]
pub struct ChunkRecorder {
    dir: PathBuf,
    sample_rate: u32,
}

impl ChunkRecorder {
    /// Create the directory (if needed) and a recorder writing into it.
    pub fn new(dir: impl Into<PathBuf>, sample_rate: u32) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, sample_rate })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one chunk as `<speaker>_<index>.wav` and return its path.
    pub fn record(&self, speaker_id: Option<u64>, index: u64, pcm: &[u8]) -> AppResult<PathBuf> {
        let speaker = speaker_id.map_or_else(|| "unknown".to_string(), |id| id.to_string());
        let path = self.dir.join(format!("{}_{:05}.wav", speaker, index));

        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, self.sample_rate, 16);
        let mut writer = BufWriter::new(File::create(&path)?);
        wav::write(header, &wav::BitDepth::Sixteen(read_pcm16(pcm)), &mut writer)?;
        Ok(path)
    }
}

/// Load a mono 16-bit WAV file, returning its sample rate and samples.
///
/// Multi-channel files are reduced to their first channel.
pub fn read_wav_mono(path: &Path) -> AppResult<(u32, Vec<i16>)> {
    let mut file = File::open(path)?;
    let (header, data) = wav::read(&mut file)?;
    let samples = data.try_into_sixteen().map_err(|_| {
        BotError::AudioValidation(format!("{} is not 16-bit PCM", path.display()))
    })?;

    let channels = header.channel_count.max(1) as usize;
    let mono = samples.into_iter().step_by(channels).collect();
    Ok((header.sampling_rate, mono))
}
