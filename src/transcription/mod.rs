//! # Transcription Module
//!
//! Turns chunks of speech into text with Whisper models running on Candle.
//!
//! ## Key Components:
//! - **Session** (`engine`): lazy model load, worker pool, result shaping
//! - **Whisper** (`model`): model download, mel features, beam search decoding
//! - **VAD** (`vad`): energy gate that keeps silence away from the decoder
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, the default; good enough for short commands
//! - **small**: ~244MB, better with unusual block names
//! - **medium**: ~769MB
//! - **large**: ~1550MB, best accuracy but slowest

pub mod engine;
pub mod model;
pub mod vad;

pub use engine::{RecognitionParams, SpeechRecognizer, Transcript, TranscriptionSession};
pub use model::{ModelSize, WhisperLoader};
