//! Error types for the mic relay

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the client may reconnect after this error.
    ///
    /// Only transport failures are retried; bad configuration, rejected
    /// handshakes and protocol violations would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Io(_) => true,
            Error::Handshake(HandshakeError::Timeout) => true,
            Error::Handshake(HandshakeError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Invalid `StreamConfig` field or settings value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("Invalid chunk size: {0} frames")]
    InvalidChunkSize(u32),

    #[error("Invalid volume: {0}")]
    InvalidVolume(f32),

    #[error("Unknown quality preset: {0}")]
    UnknownQuality(String),

    #[error("Stream format {got_rate} Hz/{got_channels} ch does not match device format {want_rate} Hz/{want_channels} ch")]
    FormatMismatch {
        got_rate: u32,
        got_channels: u16,
        want_rate: u32,
        want_channels: u16,
    },

    #[error("Failed to load config file: {0}")]
    File(String),
}

/// Malformed or rejected handshake
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Bad magic bytes")]
    BadMagic,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection refused, reset or timed out
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// Capture device or virtual sink failure
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio subsystem unavailable: {0}")]
    SubsystemUnavailable(String),

    #[error("Virtual device creation failed: {0}")]
    CreateFailed(String),

    #[error("Virtual device teardown failed: {0}")]
    TeardownFailed(String),

    #[error("Sink write failed: {0}")]
    WriteFailed(String),

    #[error("Capture stopped")]
    Stopped,

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Stream does not follow the negotiated framing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    #[error("Frame size mismatch: expected {expected} bytes, got {got}")]
    FrameSizeMismatch { expected: usize, got: usize },

    #[error("Stream ended inside a frame ({0} trailing bytes)")]
    TruncatedFrame(usize),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
