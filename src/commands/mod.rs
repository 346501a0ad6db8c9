//! # Commands Module
//!
//! World edits over the game server's remote console.
//!
//! - **plan**: slab planning and command text
//! - **rcon**: the wire protocol and TCP client
//! - **synthesizer**: connection state, retries, cooldowns and player fan-out

pub mod plan;
pub mod rcon;
pub mod synthesizer;
