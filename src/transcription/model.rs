//! # Whisper Recognizer
//!
//! Speech recognition with Whisper weights through Candle.
//!
//! ## Pipeline per chunk:
//! 1. Energy VAD keeps only the voiced regions; no speech means no segments
//! 2. Log-mel spectrogram (Slaney filterbank, 80 or 128 bins)
//! 3. Encoder pass over each 30s window
//! 4. Beam search decode, primed with the bias phrases as a previous-text prompt
//! 5. Windows the model thinks are silence and decoded with low confidence are dropped
//!
//! ## Loading:
//! Files come from the HuggingFace hub (`config.json`, `tokenizer.json`,
//! `model.safetensors`) and are cached locally; `HF_TOKEN`, `HF_HUB_CACHE` and
//! `HF_HOME` are honoured.

use crate::device::{self, DevicePreference};
use crate::error::BotError;
use crate::transcription::engine::{RecognitionParams, RecognizerLoader, SpeechRecognizer};
use crate::transcription::vad;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Whisper's STFT window at 16kHz.
const N_FFT: usize = 400;
const PREVIOUS_TEXT_TOKEN: &str = "<|startofprev|>";

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace repository holding the weights.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Approximate download size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(BotError::Config(format!("Unknown model size: {}", s))),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Downloads and loads Whisper weights on first use.
pub struct WhisperLoader {
    size: ModelSize,
    device: DevicePreference,
}

impl WhisperLoader {
    pub fn new(size: ModelSize, device: DevicePreference) -> Self {
        Self { size, device }
    }

    fn api() -> Result<hf_hub::api::tokio::Api> {
        use hf_hub::api::tokio::{Api, ApiBuilder};

        let mut builder = ApiBuilder::new()
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false);
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }

        match builder.build() {
            Ok(api) => Ok(api),
            Err(e) => {
                tracing::warn!("ApiBuilder failed ({}), falling back to defaults", e);
                Api::new().map_err(|e2| anyhow!("Cannot create HuggingFace client: {}", e2))
            }
        }
    }
}

#[async_trait]
impl RecognizerLoader for WhisperLoader {
    async fn load(&self) -> Result<Arc<dyn SpeechRecognizer>> {
        let size = self.size;
        tracing::info!("Loading Whisper {} model (~{}MB)", size, size.size_mb());

        let repo = Self::api()?.model(size.repo_name().to_string());
        let config_file = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let weights_file = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download weights from {}: {}", size.repo_name(), e))?;

        let device = device::resolve(self.device);
        let recognizer = tokio::task::spawn_blocking(move || {
            WhisperRecognizer::from_files(size, config_file, tokenizer_file, weights_file, device)
        })
        .await
        .map_err(|e| anyhow!("Model load task failed: {}", e))??;

        Ok(Arc::new(recognizer))
    }
}

/// Token ids the decoder needs, resolved once from the tokenizer.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    eot: u32,
    no_timestamps: u32,
    previous_text: u32,
    no_speech: Option<u32>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        Ok(Self {
            sot: token_id(tokenizer, m::SOT_TOKEN)?,
            transcribe: token_id(tokenizer, m::TRANSCRIBE_TOKEN)?,
            eot: token_id(tokenizer, m::EOT_TOKEN)?,
            no_timestamps: token_id(tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            previous_text: token_id(tokenizer, PREVIOUS_TEXT_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| token_id(tokenizer, token).ok()),
        })
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Tokenizer has no token {}", token))
}

/// Outcome of decoding one 30s window.
#[derive(Debug, Clone, PartialEq)]
struct WindowResult {
    text: String,
    avg_logprob: f32,
    no_speech_prob: f32,
}

impl WindowResult {
    /// Silence the model hallucinated text for.
    fn is_hallucination(&self, params: &RecognitionParams) -> bool {
        self.no_speech_prob > params.no_speech_threshold
            && self.avg_logprob < params.log_prob_threshold
    }
}

/// A loaded Whisper model.
///
/// The encoder and decoder keep key/value caches, so calls are serialized on
/// the model mutex.
pub struct WhisperRecognizer {
    size: ModelSize,
    model: Mutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    device: Device,
}

impl WhisperRecognizer {
    fn from_files(
        size: ModelSize,
        config_file: PathBuf,
        tokenizer_file: PathBuf,
        weights_file: PathBuf,
        device: Device,
    ) -> Result<Self> {
        let config: Config = serde_json::from_reader(std::fs::File::open(config_file)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;
        let mel_filters = mel_filters(config.num_mel_bins, N_FFT, m::SAMPLE_RATE as u32);

        // Safety: the cached weight file is not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        tracing::info!("Whisper {} ready on {}", size, device::label(&device));
        Ok(Self {
            size,
            model: Mutex::new(model),
            config,
            tokenizer,
            tokens,
            mel_filters,
            device,
        })
    }

    /// Decoder prefix: optional bias prompt, then the task tokens.
    ///
    /// Returns the prefix and the position of the start-of-transcript token.
    fn prompt(&self, params: &RecognitionParams) -> Result<(Vec<u32>, usize)> {
        let mut prefix = Vec::new();
        if !params.bias_phrases.is_empty() {
            let text = format!(" {}", params.bias_phrases.join(", "));
            let encoded = self
                .tokenizer
                .encode(text, false)
                .map_err(|e| anyhow!("Failed to encode bias prompt: {}", e))?;
            let ids = encoded.get_ids();
            // The previous-text prompt may use at most half the context
            let budget = self.config.max_target_positions / 2 - 1;
            prefix.push(self.tokens.previous_text);
            prefix.extend_from_slice(&ids[ids.len().saturating_sub(budget)..]);
        }

        let sot_index = prefix.len();
        prefix.push(self.tokens.sot);
        match self.tokenizer.token_to_id(&format!("<|{}|>", params.language)) {
            Some(language) => prefix.push(language),
            None => tracing::debug!("No language token for '{}'", params.language),
        }
        prefix.push(self.tokens.transcribe);
        prefix.push(self.tokens.no_timestamps);
        Ok((prefix, sot_index))
    }

    fn decode_window(
        &self,
        model: &mut m::model::Whisper,
        mel: &Tensor,
        prefix: &[u32],
        sot_index: usize,
        params: &RecognitionParams,
    ) -> Result<WindowResult> {
        let features = model.encoder.forward(mel, true)?;

        // No-speech probability is read at the start-of-transcript position
        let tokens_t = Tensor::new(prefix, &self.device)?.unsqueeze(0)?;
        let ys = model.decoder.forward(&tokens_t, &features, true)?;
        let no_speech_prob = match self.tokens.no_speech {
            Some(token) => {
                let logits = model
                    .decoder
                    .final_linear(&ys.i((..1, sot_index..sot_index + 1))?)?
                    .i(0)?
                    .i(0)?;
                candle_nn::ops::softmax(&logits, 0)?
                    .i(token as usize)?
                    .to_dtype(DType::F32)?
                    .to_scalar::<f32>()?
            }
            None => 0.0,
        };

        let max_tokens = (self.config.max_target_positions / 2).saturating_sub(prefix.len()).max(1);
        let eot = self.tokens.eot;
        let best = beam_search(params.beam_size, max_tokens, eot, |decoded| {
            let mut sequence = prefix.to_vec();
            sequence.extend_from_slice(decoded);
            let tokens_t = Tensor::new(sequence.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &features, true)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let log_probs = candle_nn::ops::log_softmax(&logits, 0)?;
            Ok(log_probs.to_dtype(DType::F32)?.to_vec1::<f32>()?)
        })?;

        let text = self
            .tokenizer
            .decode(&best.tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(WindowResult {
            text: text.trim().to_string(),
            avg_logprob: best.avg_logprob(),
            no_speech_prob,
        })
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn transcribe(&self, audio: &[f32], params: &RecognitionParams) -> Result<Vec<String>> {
        let regions = vad::speech_regions(audio, params.sample_rate, &params.vad);
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        let speech = vad::collect_speech(audio, &regions);

        let mel = m::audio::pcm_to_mel(&self.config, &speech, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        let (prefix, sot_index) = self.prompt(params)?;

        let mut model = self.model.lock();
        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < frames {
            let len = (frames - seek).min(m::N_FRAMES);
            let window = mel.narrow(2, seek, len)?;
            let result = self.decode_window(&mut model, &window, &prefix, sot_index, params)?;
            if result.is_hallucination(params) {
                tracing::debug!(
                    "Dropping window (no speech {:.2}, avg logprob {:.2}): {:?}",
                    result.no_speech_prob,
                    result.avg_logprob,
                    result.text
                );
            } else if !result.text.is_empty() {
                segments.push(result.text);
            }
            seek += len;
        }
        Ok(segments)
    }

    fn name(&self) -> String {
        format!("whisper-{}", self.size)
    }
}

/// One beam search candidate.
#[derive(Debug, Clone, PartialEq)]
struct Hypothesis {
    /// Decoded tokens, without the end-of-text token
    tokens: Vec<u32>,
    sum_logprob: f32,
}

impl Hypothesis {
    /// Length-normalized score; the end-of-text token counts as one step.
    fn avg_logprob(&self) -> f32 {
        self.sum_logprob / (self.tokens.len() + 1) as f32
    }
}

/// Beam search over `next_log_probs`, which returns vocabulary log-probabilities
/// after the given decoded tokens. Ids above `eot` are never emitted.
fn beam_search<F>(beam_size: usize, max_tokens: usize, eot: u32, mut next_log_probs: F) -> Result<Hypothesis>
where
    F: FnMut(&[u32]) -> Result<Vec<f32>>,
{
    let beam_size = beam_size.max(1);
    let mut beams = vec![Hypothesis { tokens: Vec::new(), sum_logprob: 0.0 }];
    let mut finished: Vec<Hypothesis> = Vec::new();

    for _ in 0..max_tokens {
        let mut candidates: Vec<(Hypothesis, bool)> = Vec::new();
        for beam in &beams {
            let log_probs = next_log_probs(&beam.tokens)?;
            for (token, log_prob) in top_k(&log_probs, eot, beam_size + 1) {
                if is_repetitive(&beam.tokens, token) {
                    continue;
                }
                let done = token == eot;
                let mut tokens = beam.tokens.clone();
                if !done {
                    tokens.push(token);
                }
                candidates.push((
                    Hypothesis { tokens, sum_logprob: beam.sum_logprob + log_prob },
                    done,
                ));
            }
        }
        candidates.sort_by(|a, b| b.0.sum_logprob.total_cmp(&a.0.sum_logprob));

        // Only finishes ranked above the weakest surviving beam count
        beams.clear();
        for (hypothesis, done) in candidates {
            if beams.len() == beam_size {
                break;
            }
            if done {
                finished.push(hypothesis);
            } else {
                beams.push(hypothesis);
            }
        }
        if finished.len() >= beam_size || beams.is_empty() {
            break;
        }
    }

    let pool = if finished.is_empty() { beams } else { finished };
    pool.into_iter()
        .max_by(|a, b| a.avg_logprob().total_cmp(&b.avg_logprob()))
        .ok_or_else(|| anyhow!("Beam search produced no hypothesis"))
}

/// The `k` most likely tokens with ids up to `max_token`, best first.
fn top_k(log_probs: &[f32], max_token: u32, k: usize) -> Vec<(u32, f32)> {
    let limit = log_probs.len().min(max_token as usize + 1);
    let mut best: Vec<(u32, f32)> = Vec::with_capacity(k + 1);
    for (token, &log_prob) in log_probs[..limit].iter().enumerate() {
        if !log_prob.is_finite() {
            continue;
        }
        if best.len() == k && best.last().is_some_and(|&(_, worst)| log_prob <= worst) {
            continue;
        }
        let at = best.partition_point(|&(_, p)| p >= log_prob);
        best.insert(at, (token as u32, log_prob));
        best.truncate(k);
    }
    best
}

/// Would `next` start a loop: the same token three times in a row, or the
/// last three tokens repeating the three before them.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 2 && tokens[n - 2..].iter().all(|&t| t == next) {
        return true;
    }
    if n >= 5 {
        let last = [tokens[n - 2], tokens[n - 1], next];
        return tokens[n - 5..n - 2] == last;
    }
    false
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / log_step
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (log_step * (mel - min_log_mel)).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney-normalized triangular mel filterbank, row-major `n_mels x (n_fft/2 + 1)`.
pub fn mel_filters(n_mels: usize, n_fft: usize, sample_rate: u32) -> Vec<f32> {
    let bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let max_mel = hz_to_mel(nyquist);
    let centers: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * bins];
    for m in 0..n_mels {
        let (lower, center, upper) = (centers[m], centers[m + 1], centers[m + 2]);
        let norm = 2.0 / (upper - lower);
        for k in 0..bins {
            let freq = k as f64 * sample_rate as f64 / n_fft as f64;
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * bins + k] = (weight * norm) as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!(matches!("huge".parse::<ModelSize>(), Err(BotError::Config(_))));
        assert_eq!(ModelSize::Base.to_string(), "base");
        assert_eq!(ModelSize::Base.repo_name(), "openai/whisper-base");
    }

    #[test]
    fn test_mel_filters_shape() {
        let filters = mel_filters(80, N_FFT, 16000);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|&w| w >= 0.0));

        // Every filter covers some bins and filter peaks move up in frequency
        let peaks: Vec<usize> = filters
            .chunks(201)
            .map(|row| {
                assert!(row.iter().any(|&w| w > 0.0));
                row.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(k, _)| k)
                    .unwrap()
            })
            .collect();
        assert!(peaks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 300.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_top_k() {
        let log_probs = vec![-3.0, -0.5, f32::NEG_INFINITY, -1.0, -0.1, -0.2];
        assert_eq!(top_k(&log_probs, 5, 2), vec![(4, -0.1), (5, -0.2)]);
        // Ids above the limit are suppressed
        assert_eq!(top_k(&log_probs, 3, 2), vec![(1, -0.5), (3, -1.0)]);
    }

    #[test]
    fn test_repetition_guard() {
        assert!(is_repetitive(&[5, 7, 7], 7));
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(!is_repetitive(&[1, 2, 3, 1, 2], 4));
        assert!(!is_repetitive(&[7], 7));
    }

    /// Vocabulary of 4 tokens with id 3 as end-of-text.
    fn scripted(decoded: &[u32]) -> Result<Vec<f32>> {
        let p = |v: [f32; 4]| Ok(v.iter().map(|x| x.ln()).collect());
        match decoded {
            [] => p([0.6, 0.3, 0.05, 0.05]),
            // Greedy path: 0 then a flat distribution
            [0] => p([0.3, 0.3, 0.2, 0.2]),
            // Second choice leads to a confident finish
            [1] => p([0.01, 0.01, 0.9, 0.08]),
            [1, 2] => p([0.01, 0.01, 0.01, 0.97]),
            _ => p([0.1, 0.1, 0.1, 0.7]),
        }
    }

    #[test]
    fn test_beam_search_beats_greedy() {
        let best = beam_search(3, 10, 3, scripted).unwrap();
        assert_eq!(best.tokens, vec![1, 2]);
        assert!(best.avg_logprob() > -1.0);

        let greedy = beam_search(1, 10, 3, scripted).unwrap();
        assert_eq!(greedy.tokens, vec![0, 0]);
    }

    #[test]
    fn test_beam_search_stops_at_max_tokens() {
        let best = beam_search(2, 3, 99, |_| Ok(vec![-0.1, -0.2, -0.3])).unwrap();
        assert!(best.tokens.len() <= 3);
    }

    #[test]
    fn test_hallucination_gate() {
        let params = RecognitionParams::from_config(&crate::config::AppConfig::default().recognizer, 16000);
        let silent = WindowResult { text: "thanks".into(), avg_logprob: -2.0, no_speech_prob: 0.9 };
        let confident = WindowResult { avg_logprob: -0.2, ..silent.clone() };
        let speech = WindowResult { no_speech_prob: 0.1, ..silent.clone() };
        assert!(silent.is_hallucination(&params));
        assert!(!confident.is_hallucination(&params));
        assert!(!speech.is_hallucination(&params));
    }
}
