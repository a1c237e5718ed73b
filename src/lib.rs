//! # Mic Relay
//!
//! Relays a live microphone from one machine to another over TCP, where it
//! shows up as a virtual audio input device.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── CLIENT PC ────────────────────────────┐
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐              │
//! │  │ Microphone  │──▶│ Gain Stage  │──▶│ Level Check │              │
//! │  │ (cpal)      │   │ (saturate)  │   │ (warn only) │              │
//! │  └─────────────┘   └─────────────┘   └──────┬──────┘              │
//! │        capture pump thread                  │ bounded mpsc        │
//! │                                             ▼                     │
//! │                    ┌───────────────────────────────────────┐      │
//! │                    │ Streaming Client (tokio task)          │      │
//! │                    │ handshake ─▶ raw PCM16LE frames        │      │
//! │                    └──────────────────┬────────────────────┘      │
//! └───────────────────────────────────────┼───────────────────────────┘
//!                                         │ TCP
//! ┌───────────────────────────────────────┼──── SERVER PC ────────────┐
//! │                    ┌──────────────────▼────────────────────┐      │
//! │                    │ Streaming Server (one session at once) │      │
//! │                    │ handshake ─▶ frame reassembly          │      │
//! │                    └──────────────────┬────────────────────┘      │
//! │                                       │ bounded mpsc (quality)    │
//! │                    ┌──────────────────▼────────────────────┐      │
//! │                    │ Sink Writer (blocking thread, gain)    │      │
//! │                    └──────────────────┬────────────────────┘      │
//! │                    ┌──────────────────▼────────────────────┐      │
//! │                    │ Virtual Sink (FIFO + pipe-source)      │──▶ apps
//! │                    └───────────────────────────────────────┘      │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod control;
pub mod error;
pub mod network;
pub mod protocol;
pub mod quality;
pub mod sink;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default sample rate for capture and the virtual device
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default TCP port for the audio stream
    pub const DEFAULT_PORT: u16 = 5000;

    /// Default name of the virtual input device
    pub const DEFAULT_DEVICE_NAME: &str = "YaP-Mic-Pass-Ult";

    /// Bytes per PCM16 sample
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Accepted sample rate range (inclusive)
    pub const MIN_SAMPLE_RATE: u32 = 8000;
    pub const MAX_SAMPLE_RATE: u32 = 96000;

    /// Accepted chunk size range in frames (inclusive)
    pub const MIN_CHUNK_SIZE: u32 = 64;
    pub const MAX_CHUNK_SIZE: u32 = 4096;

    /// Gain range
    pub const MIN_VOLUME: f32 = 0.0;
    pub const MAX_VOLUME: f32 = 2.0;

    /// Largest handshake payload accepted on the wire
    pub const MAX_HANDSHAKE_LEN: usize = 256;

    /// Time allowed for each side of the handshake
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Time allowed for the TCP connect
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// A frame write that takes longer than this counts as a disconnect
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Socket buffer size used on both ends
    pub const SOCKET_BUFFER_SIZE: usize = 8192;

    /// Poll interval for cancellable blocking loops
    pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// Audio the server keeps reading ahead while the virtual device has no
    /// reader; older frames are dropped beyond this
    pub const STALL_BACKLOG: Duration = Duration::from_secs(5);
}
