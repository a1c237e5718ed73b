//! Configuration
//!
//! `StreamConfig` is the per-session contract negotiated in the handshake.
//! `ClientConfig` and `ServerConfig` are the user-facing settings; both can
//! be loaded from a TOML file and overridden from the command line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;
use crate::quality::{Quality, QualityProfile};

/// Clamp a volume into the accepted gain range. NaN is rejected.
pub fn clamp_volume(volume: f32) -> Result<f32, ConfigError> {
    if volume.is_nan() {
        return Err(ConfigError::InvalidVolume(volume));
    }
    Ok(volume.clamp(MIN_VOLUME, MAX_VOLUME))
}

/// Parameters of one streaming session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo)
    pub channels: u16,
    /// Frames per chunk on the wire
    pub chunk_size: u32,
    /// Preset the chunk size was resolved from
    pub quality: Quality,
    /// Gain applied at capture time
    pub volume: f32,
}

impl StreamConfig {
    /// Build a validated config. An explicit chunk size overrides the preset.
    pub fn new(
        sample_rate: u32,
        channels: u16,
        chunk_size: Option<u32>,
        quality: Quality,
        volume: f32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            sample_rate,
            channels,
            chunk_size: quality.resolve_chunk_size(chunk_size),
            quality,
            volume: clamp_volume(volume)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every field against the accepted bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ConfigError::InvalidChannels(self.channels));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(self.chunk_size));
        }
        if self.volume.is_nan() || !(MIN_VOLUME..=MAX_VOLUME).contains(&self.volume) {
            return Err(ConfigError::InvalidVolume(self.volume));
        }
        Ok(())
    }

    /// Interleaved samples in one frame
    pub fn samples_per_frame(&self) -> usize {
        self.chunk_size as usize * self.channels as usize
    }

    /// Bytes in one frame on the wire
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * BYTES_PER_SAMPLE
    }

    /// Playback duration of one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate as f64)
    }

    /// Profile of the session's quality preset
    pub fn profile(&self) -> QualityProfile {
        self.quality.profile()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_size: Quality::Balanced.profile().chunk_size,
            quality: Quality::Balanced,
            volume: 1.0,
        }
    }
}

/// Client reconnect behaviour after a dropped session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect at all
    pub enabled: bool,
    /// Give up after this many consecutive failed attempts (0 = never)
    pub max_attempts: u32,
    /// First back-off delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Back-off cap in milliseconds
    pub max_backoff_ms: u64,
}

impl ReconnectPolicy {
    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }

    /// Delay before attempt number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

/// Streaming client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Input device index from the device listing (None = default device)
    pub device_index: Option<usize>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Explicit chunk size; overrides the quality preset when set
    pub chunk_size: Option<u32>,
    pub quality: Quality,
    pub volume: f32,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Frames in the low-level detection window
    pub level_window_frames: usize,
}

impl ClientConfig {
    /// Resolve the validated stream config
    pub fn stream_config(&self) -> Result<StreamConfig, ConfigError> {
        StreamConfig::new(
            self.sample_rate,
            self.channels,
            self.chunk_size,
            self.quality,
            self.volume,
        )
    }

    /// `host:port` of the server
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            device_index: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_size: None,
            quality: Quality::Balanced,
            volume: 1.0,
            reconnect: ReconnectPolicy::default(),
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            write_timeout_ms: WRITE_TIMEOUT.as_millis() as u64,
            level_window_frames: 100,
        }
    }
}

/// Streaming server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_address: String,
    pub port: u16,
    /// Name of the virtual input device
    pub device_name: String,
    /// Gain applied by the sink writer
    pub volume: f32,
    /// Format of the virtual device; sessions must match it
    pub sample_rate: u32,
    pub channels: u16,
    /// Register the FIFO with PulseAudio (otherwise FIFO only)
    pub use_pulseaudio: bool,
    pub handshake_timeout_ms: u64,
}

impl ServerConfig {
    /// Check the settings and clamp the volume
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.volume = clamp_volume(self.volume)?;
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ConfigError::InvalidChannels(self.channels));
        }
        Ok(())
    }

    /// `bind_address:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Reject a session whose format differs from the device's
    pub fn check_format(&self, stream: &StreamConfig) -> Result<(), ConfigError> {
        if stream.sample_rate != self.sample_rate || stream.channels != self.channels {
            return Err(ConfigError::FormatMismatch {
                got_rate: stream.sample_rate,
                got_channels: stream.channels,
                want_rate: self.sample_rate,
                want_channels: self.channels,
            });
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            volume: 1.0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            use_pulseaudio: true,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Default location: `<config dir>/mic-relay/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "mic-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults; an unreadable or invalid one is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::File(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
            .map_err(|e| ConfigError::File(format!("{}: {}", path.display(), e)))
    }

    /// Parse from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::File(e.to_string()))
    }
}
