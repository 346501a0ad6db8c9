//! Energy-based voice activity detection.
//!
//! Frames of 30ms are scored by loudness, mapped from -60 dBFS (0.0) to
//! 0 dBFS (1.0), and compared with the configured threshold. Voiced runs
//! separated by less than `min_silence_ms` are merged, runs shorter than
//! `min_speech_ms` are dropped, and survivors are padded by `speech_pad_ms`.

use crate::audio::processor::rms;
use crate::transcription::engine::VadParams;
use std::ops::Range;

const FRAME_MS: usize = 30;
const FLOOR_DB: f32 = -60.0;

/// Loudness of a frame on a 0.0 - 1.0 scale.
pub fn speech_score(frame: &[f32]) -> f32 {
    let level = rms(frame);
    if level <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * level.log10();
    ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0)
}

/// Sample ranges that contain speech, sorted and non-overlapping.
pub fn speech_regions(audio: &[f32], sample_rate: u32, params: &VadParams) -> Vec<Range<usize>> {
    let per_ms = sample_rate as usize / 1000;
    let frame_len = (FRAME_MS * per_ms).max(1);
    let min_silence = params.min_silence_ms as usize * per_ms;
    let min_speech = params.min_speech_ms as usize * per_ms;
    let pad = params.speech_pad_ms as usize * per_ms;

    // Raw voiced runs
    let mut runs: Vec<Range<usize>> = Vec::new();
    for (index, frame) in audio.chunks(frame_len).enumerate() {
        if speech_score(frame) < params.threshold {
            continue;
        }
        let start = index * frame_len;
        let end = start + frame.len();
        match runs.last_mut() {
            Some(last) if start - last.end < min_silence.max(1) => last.end = end,
            _ => runs.push(start..end),
        }
    }

    let mut regions: Vec<Range<usize>> = Vec::new();
    for run in runs.into_iter().filter(|r| r.len() >= min_speech) {
        let padded = run.start.saturating_sub(pad)..(run.end + pad).min(audio.len());
        match regions.last_mut() {
            Some(last) if padded.start <= last.end => last.end = last.end.max(padded.end),
            _ => regions.push(padded),
        }
    }
    regions
}

/// Concatenate the speech regions of `audio`.
pub fn collect_speech(audio: &[f32], regions: &[Range<usize>]) -> Vec<f32> {
    regions
        .iter()
        .flat_map(|r| audio[r.clone()].iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> VadParams {
        VadParams {
            threshold: 0.2,
            min_silence_ms: 200,
            min_speech_ms: 100,
            speech_pad_ms: 300,
        }
    }

    fn tone(samples: usize, amplitude: f32) -> Vec<f32> {
        (0..samples)
            .map(|i| amplitude * (i as f32 * 0.05).sin())
            .collect()
    }

    #[test]
    fn test_silence_has_no_regions() {
        assert!(speech_regions(&vec![0.0; 16000], 16000, &params()).is_empty());
        assert!(speech_regions(&tone(16000, 0.0005), 16000, &params()).is_empty());
        assert_eq!(speech_score(&[]), 0.0);
    }

    #[test]
    fn test_speech_is_padded() {
        // 1s silence, 0.5s speech, 1s silence at 16kHz
        let mut audio = vec![0.0; 16000];
        audio.extend(tone(8000, 0.5));
        audio.extend(vec![0.0; 16000]);

        let regions = speech_regions(&audio, 16000, &params());
        assert_eq!(regions.len(), 1);
        let region = &regions[0];
        // 300ms pad = 4800 samples either side, on 30ms frame boundaries
        assert!(region.start <= 16000 - 4800 + 480);
        assert!(region.end >= 24000 + 4800 - 480);
        assert_eq!(collect_speech(&audio, &regions).len(), region.len());
    }

    #[test]
    fn test_short_blips_are_dropped() {
        let mut audio = vec![0.0; 16000];
        audio[8000..8480].copy_from_slice(&tone(480, 0.5));
        assert!(speech_regions(&audio, 16000, &params()).is_empty());
    }

    #[test]
    fn test_short_gaps_are_merged() {
        let mut audio = tone(4800, 0.5);
        audio.extend(vec![0.0; 960]); // 60ms pause
        audio.extend(tone(4800, 0.5));
        assert_eq!(speech_regions(&audio, 16000, &params()).len(), 1);
    }
}
