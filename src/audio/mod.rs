//! # Audio Module
//!
//! Everything between the voice transport and the recognizer.
//!
//! ## Key Components:
//! - **Queue**: bounded, drop-oldest ingest queue; producers never block
//! - **Ingest**: packet decoding at the transport boundary
//! - **Buffer**: per-speaker accumulation into fixed-length chunks
//! - **Processor**: PCM16 decoding, decimation, gain and chunk recording
//! - **Session**: one channel's queue, processing loop and teardown
//!
//! ## Audio Format:
//! - **Inbound**: 48kHz mono PCM16 little-endian, 20ms frames
//! - **Recognizer**: 16kHz mono `f32` in `[-1.0, 1.0]`

pub mod buffer;
pub mod ingest;
pub mod processor;
pub mod queue;
pub mod session;
