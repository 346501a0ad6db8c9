//! # Remote Console Client
//!
//! Minimal client for the game server's RCON protocol.
//!
//! ## Wire format (all integers little-endian i32):
//! ```text
//! | length | request id | type | body (ASCII) | 0x00 0x00 |
//! ```
//! `length` counts everything after itself, so it is `body.len() + 10`.
//!
//! ## Exchange:
//! 1. Send type 3 (login) with the password. A reply id of -1 means the password was wrong.
//! 2. Send type 2 (command) packets; each is answered by one type 0 packet.
//!
//! Bodies are limited to 4096 bytes in both directions. Replies longer than one
//! packet are truncated by the server; none of the commands issued here come close.

use crate::config::RconConfig;
use crate::error::{AppResult, BotError};
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const PACKET_LOGIN: i32 = 3;
pub const PACKET_COMMAND: i32 = 2;
pub const PACKET_RESPONSE: i32 = 0;
pub const MAX_BODY_BYTES: usize = 4096;

/// id + type + two terminating nulls
const HEADER_AND_PADDING: usize = 10;

/// A connection to something that executes console commands.
///
/// The command synthesizer drives this trait so tests can script replies
/// without a running server.
#[async_trait]
pub trait RemoteConsole: Send {
    /// Open (or reopen) the connection and authenticate.
    async fn connect(&mut self) -> AppResult<()>;

    /// Run one command and return the server's reply text.
    async fn execute(&mut self, command: &str) -> AppResult<String>;

    /// Close the connection. Never fails.
    async fn disconnect(&mut self);
}

/// One decoded RCON packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

/// Serialize a packet into its wire form.
pub fn encode_packet(id: i32, kind: i32, body: &str) -> AppResult<Vec<u8>> {
    if body.len() > MAX_BODY_BYTES {
        return Err(BotError::Command(format!(
            "Command body of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_BODY_BYTES
        )));
    }

    let mut buf = Vec::with_capacity(body.len() + HEADER_AND_PADDING + 4);
    WriteBytesExt::write_i32::<LittleEndian>(&mut buf, (body.len() + HEADER_AND_PADDING) as i32)?;
    WriteBytesExt::write_i32::<LittleEndian>(&mut buf, id)?;
    WriteBytesExt::write_i32::<LittleEndian>(&mut buf, kind)?;
    buf.extend_from_slice(body.as_bytes());
    buf.extend_from_slice(&[0, 0]);
    Ok(buf)
}

/// Parse a packet payload (everything after the length prefix).
pub fn decode_payload(payload: &[u8]) -> AppResult<Packet> {
    if payload.len() < HEADER_AND_PADDING {
        return Err(BotError::ProtocolParse(format!(
            "RCON packet too short: {} bytes",
            payload.len()
        )));
    }
    let id = LittleEndian::read_i32(&payload[0..4]);
    let kind = LittleEndian::read_i32(&payload[4..8]);
    let body_bytes = &payload[8..payload.len() - 2];
    let body = String::from_utf8_lossy(body_bytes).into_owned();
    Ok(Packet { id, kind, body })
}

async fn read_packet(stream: &mut TcpStream) -> AppResult<Packet> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = LittleEndian::read_i32(&len_bytes);
    if len < HEADER_AND_PADDING as i32 || len as usize > MAX_BODY_BYTES + HEADER_AND_PADDING {
        return Err(BotError::ProtocolParse(format!("Invalid RCON packet length {}", len)));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    decode_payload(&payload)
}

/// RCON over TCP with a per-call timeout.
pub struct RconClient {
    host: String,
    port: u16,
    password: String,
    timeout: Duration,
    stream: Option<TcpStream>,
    next_id: i32,
}

impl RconClient {
    pub fn new(config: &RconConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            stream: None,
            next_id: 0,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn next_request_id(&mut self) -> i32 {
        // Stay positive: -1 is reserved for auth failure
        self.next_id = if self.next_id >= i32::MAX - 1 { 1 } else { self.next_id + 1 };
        self.next_id
    }

    async fn open(&mut self) -> AppResult<TcpStream> {
        let address = self.address();
        let mut stream = TcpStream::connect(&address).await.map_err(|e| {
            BotError::Connection(format!("Cannot reach RCON at {}: {}", address, e))
        })?;

        let id = self.next_request_id();
        stream
            .write_all(&encode_packet(id, PACKET_LOGIN, &self.password)?)
            .await
            .map_err(|e| BotError::Connection(format!("Failed to send login: {}", e)))?;

        let reply = read_packet(&mut stream)
            .await
            .map_err(|e| BotError::Connection(format!("No login reply: {}", e)))?;
        if reply.id == -1 {
            return Err(BotError::Connection("RCON authentication failed".to_string()));
        }
        if reply.id != id {
            return Err(BotError::Connection(format!(
                "Login reply id {} does not match request {}",
                reply.id, id
            )));
        }
        Ok(stream)
    }

    async fn round_trip(&mut self, command: &str) -> AppResult<String> {
        let id = self.next_request_id();
        let packet = encode_packet(id, PACKET_COMMAND, command)?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BotError::Connection("Not connected".to_string()))?;

        stream.write_all(&packet).await?;
        let reply = read_packet(stream).await?;
        if reply.id != id || reply.kind != PACKET_RESPONSE {
            return Err(BotError::ProtocolParse(format!(
                "Unexpected reply (id {}, type {}) to request {}",
                reply.id, reply.kind, id
            )));
        }
        Ok(reply.body)
    }
}

#[async_trait]
impl RemoteConsole for RconClient {
    async fn connect(&mut self) -> AppResult<()> {
        self.stream = None;
        let stream = tokio::time::timeout(self.timeout, self.open())
            .await
            .map_err(|_| BotError::Connection(format!("Timed out connecting to {}", self.address())))??;
        self.stream = Some(stream);
        tracing::info!("Connected to RCON at {}", self.address());
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> AppResult<String> {
        if self.stream.is_none() {
            return Err(BotError::Connection("Not connected".to_string()));
        }

        let result = match tokio::time::timeout(self.timeout, self.round_trip(command)).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => Err(BotError::Command(format!("'{}' failed: {}", command, e))),
            Err(_) => Err(BotError::Command(format!("'{}' timed out", command))),
        };

        if result.is_err() {
            // The stream may hold a half-read reply; never reuse it
            self.stream = None;
        }
        result
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Error closing RCON stream: {}", e);
            }
            tracing::info!("Disconnected from RCON at {}", self.address());
        }
    }
}
