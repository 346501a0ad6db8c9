//! Scripted stand-ins for the game server and the speech recognizer.

use crate::audio::queue::AudioFrame;
use crate::commands::rcon::RemoteConsole;
use crate::config::AppConfig;
use crate::detection::Vocabulary;
use crate::error::{AppResult, BotError};
use crate::state::AppContext;
use crate::transcription::engine::{RecognitionParams, RecognizerLoader, SpeechRecognizer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Everything a `FakeConsole` saw.
#[derive(Debug, Default)]
pub struct ConsoleLog {
    pub connects: usize,
    /// Every command passed to `execute`, failed or not
    pub attempts: Vec<String>,
    /// Commands that succeeded
    pub executed: Vec<String>,
}

impl ConsoleLog {
    /// Successful world-edit commands, in order.
    pub fn fills(&self) -> Vec<String> {
        self.executed
            .iter()
            .filter(|c| c.contains(" run fill "))
            .cloned()
            .collect()
    }
}

/// In-memory remote console.
///
/// Answers `list` with the configured players and everything else with `ok`.
pub struct FakeConsole {
    list_reply: String,
    fail_first_commands: usize,
    fail_connects_after: Option<usize>,
    fail_matching: Option<String>,
    log: Arc<Mutex<ConsoleLog>>,
}

impl FakeConsole {
    pub fn with_players(players: &[&str]) -> Self {
        Self::with_list_reply(&format!(
            "There are {} of a max of 20 players online: {}",
            players.len(),
            players.join(", ")
        ))
    }

    pub fn with_list_reply(reply: &str) -> Self {
        Self {
            list_reply: reply.to_string(),
            fail_first_commands: 0,
            fail_connects_after: None,
            fail_matching: None,
            log: Arc::new(Mutex::new(ConsoleLog::default())),
        }
    }

    /// The first `n` commands fail.
    pub fn failing_commands(mut self, n: usize) -> Self {
        self.fail_first_commands = n;
        self
    }

    /// Connects succeed `n` times, then fail.
    pub fn failing_connects_after(mut self, n: usize) -> Self {
        self.fail_connects_after = Some(n);
        self
    }

    /// Every command containing `needle` fails.
    pub fn failing_matching(mut self, needle: &str) -> Self {
        self.fail_matching = Some(needle.to_string());
        self
    }

    pub fn log(&self) -> Arc<Mutex<ConsoleLog>> {
        self.log.clone()
    }
}

#[async_trait]
impl RemoteConsole for FakeConsole {
    async fn connect(&mut self) -> AppResult<()> {
        let mut log = self.log.lock();
        if self.fail_connects_after.is_some_and(|n| log.connects >= n) {
            return Err(BotError::Connection("connection refused".to_string()));
        }
        log.connects += 1;
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> AppResult<String> {
        let mut log = self.log.lock();
        log.attempts.push(command.to_string());

        let scripted_failure = log.attempts.len() <= self.fail_first_commands;
        let matched = self.fail_matching.as_deref().is_some_and(|n| command.contains(n));
        if scripted_failure || matched {
            return Err(BotError::Command(format!("'{}' failed", command)));
        }

        log.executed.push(command.to_string());
        if command == "list" {
            Ok(self.list_reply.clone())
        } else {
            Ok("ok".to_string())
        }
    }

    async fn disconnect(&mut self) {}
}

#[derive(Debug, Default)]
struct CallLog {
    loads: usize,
    transcriptions: usize,
    last_bias: Vec<String>,
}

/// Shared view of what a `FakeLoader` and its recognizer were asked to do.
#[derive(Debug, Clone, Default)]
pub struct RecognizerCalls(Arc<Mutex<CallLog>>);

impl RecognizerCalls {
    pub fn loads(&self) -> usize {
        self.0.lock().loads
    }

    pub fn transcriptions(&self) -> usize {
        self.0.lock().transcriptions
    }

    pub fn last_bias(&self) -> Vec<String> {
        self.0.lock().last_bias.clone()
    }
}

struct FakeRecognizer {
    segments: Vec<String>,
    fail: bool,
    delay: Option<Duration>,
    calls: RecognizerCalls,
}

impl SpeechRecognizer for FakeRecognizer {
    fn transcribe(&self, _audio: &[f32], params: &RecognitionParams) -> anyhow::Result<Vec<String>> {
        {
            let mut calls = self.calls.0.lock();
            calls.transcriptions += 1;
            calls.last_bias = params.bias_phrases.clone();
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            anyhow::bail!("decoder exploded");
        }
        Ok(self.segments.clone())
    }

    fn name(&self) -> String {
        "fake".to_string()
    }
}

/// Loader producing a recognizer that always returns the same segments.
pub struct FakeLoader {
    segments: Vec<String>,
    fail_load: bool,
    fail_transcriptions: bool,
    delay: Option<Duration>,
    calls: RecognizerCalls,
}

impl FakeLoader {
    pub fn replying(segments: &[&str]) -> Self {
        Self {
            segments: segments.iter().map(|s| s.to_string()).collect(),
            fail_load: false,
            fail_transcriptions: false,
            delay: None,
            calls: RecognizerCalls::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_load: true,
            ..Self::replying(&[])
        }
    }

    pub fn failing_transcriptions(mut self) -> Self {
        self.fail_transcriptions = true;
        self
    }

    /// Each transcription blocks its worker for `delay`.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> RecognizerCalls {
        self.calls.clone()
    }
}

#[async_trait]
impl RecognizerLoader for FakeLoader {
    async fn load(&self) -> anyhow::Result<Arc<dyn SpeechRecognizer>> {
        self.calls.0.lock().loads += 1;
        // Yield so concurrent callers really overlap
        tokio::task::yield_now().await;
        if self.fail_load {
            anyhow::bail!("weights not found");
        }
        Ok(Arc::new(FakeRecognizer {
            segments: self.segments.clone(),
            fail: self.fail_transcriptions,
            delay: self.delay,
            calls: self.calls.clone(),
        }))
    }
}

/// Default config with one-second chunks so tests stay small.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.rcon.password = "secret".to_string();
    config.audio.chunk_seconds = 1;
    config.audio.pop_timeout_ms = 10;
    config
}

pub fn test_context(vocabulary: Vocabulary, console: FakeConsole, loader: FakeLoader) -> AppContext {
    AppContext::new(test_config(), vocabulary, Box::new(console), Arc::new(loader))
}

/// 20ms of audible 48kHz PCM16.
pub fn speech_frame(speaker_id: Option<u64>, sequence: u64) -> AudioFrame {
    let pcm = (0..960i16)
        .flat_map(|i| (if i % 2 == 0 { 1000i16 } else { -1000 }).to_le_bytes())
        .collect();
    AudioFrame::new(speaker_id, pcm, sequence)
}

/// Frames in one second of audio at 48kHz.
pub const FRAMES_PER_SECOND: u64 = 50;
