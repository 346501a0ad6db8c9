//! # voicecraft
//!
//! Listens to a voice channel, transcribes what players say and turns spoken
//! commands into world edits on a Minecraft server over RCON.
//!
//! ## Application Architecture:
//! - **audio**: ingest queue, chunking, resampling and channel sessions
//! - **transcription**: Whisper recognition behind a lazily loaded worker pool
//! - **detection**: vocabulary and phrase matching on transcripts
//! - **commands**: RCON client and the command synthesizer
//! - **pipeline**: the loop tying the stages together
//! - **config / state / error / device**: shared plumbing

pub mod audio;
pub mod commands;
pub mod config;
pub mod detection;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod state;
pub mod transcription;

#[cfg(test)]
pub mod test_helpers;
