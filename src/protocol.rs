//! Handshake wire format
//!
//! Control messages are only exchanged once, right after connect:
//!
//! ```text
//! ┌──────────┬─────────┬──────────────┬──────────────────────┐
//! │ "MICR"   │ version │ length (u16) │ bincode payload       │
//! │ 4 bytes  │ 1 byte  │ LE, ≤ 256    │ `length` bytes        │
//! └──────────┴─────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The client sends a [`HandshakeRequest`], the server answers with a
//! [`HandshakeResponse`]. After `Accepted` the connection carries raw
//! PCM16LE frames of a fixed size and nothing else.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::StreamConfig;
use crate::constants::MAX_HANDSHAKE_LEN;
use crate::error::HandshakeError;
use crate::quality::Quality;

/// Magic bytes opening every control message
pub const MAGIC: [u8; 4] = *b"MICR";

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed header
pub const HEADER_LEN: usize = 7;

/// Session parameters proposed by the client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: u32,
    pub quality: Quality,
    pub volume: f32,
}

impl HandshakeRequest {
    /// Validate into a session config. Values are checked, not repaired,
    /// except the volume which clamps like everywhere else.
    pub fn into_config(self) -> Result<StreamConfig, crate::error::ConfigError> {
        let config = StreamConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            chunk_size: self.chunk_size,
            quality: self.quality,
            volume: crate::config::clamp_volume(self.volume)?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<&StreamConfig> for HandshakeRequest {
    fn from(config: &StreamConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            chunk_size: config.chunk_size,
            quality: config.quality,
            volume: config.volume,
        }
    }
}

/// Server verdict on a handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HandshakeResponse {
    Accepted,
    Rejected { reason: String },
}

impl HandshakeResponse {
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandshakeResponse::Rejected {
            reason: reason.into(),
        }
    }
}

/// Encode a message with its header
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, HandshakeError> {
    let payload =
        bincode::serialize(message).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    if payload.len() > MAX_HANDSHAKE_LEN {
        return Err(HandshakeError::TooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Parse a header, returning the payload length
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<usize, HandshakeError> {
    if header[..4] != MAGIC {
        return Err(HandshakeError::BadMagic);
    }
    if header[4] != PROTOCOL_VERSION {
        return Err(HandshakeError::UnsupportedVersion(header[4]));
    }
    let len = u16::from_le_bytes([header[5], header[6]]) as usize;
    if len > MAX_HANDSHAKE_LEN {
        return Err(HandshakeError::TooLarge(len));
    }
    Ok(len)
}

/// Decode a payload whose header was already consumed
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, HandshakeError> {
    bincode::deserialize(payload).map_err(|e| HandshakeError::Malformed(e.to_string()))
}

/// Write one control message
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode_message(message)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one control message
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, HandshakeError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;
    let len = decode_header(&header)?;

    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload).await?;
    decode_payload(&payload)
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), HandshakeError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(HandshakeError::Closed),
        Err(e) => Err(HandshakeError::Io(e)),
    }
}
