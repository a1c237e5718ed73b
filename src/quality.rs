//! Quality presets
//!
//! A preset trades latency for smoothness. It resolves to a chunk size for
//! the wire and a queue depth for the server's sink writer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Named latency/overhead trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Small chunks, minimal delay, more packets per second
    LowLatency,
    /// Default trade-off
    #[default]
    Balanced,
    /// Large chunks, smoothest playback, more delay
    HighQuality,
}

impl Quality {
    pub const ALL: [Quality; 3] = [Quality::LowLatency, Quality::Balanced, Quality::HighQuality];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::LowLatency => "low_latency",
            Quality::Balanced => "balanced",
            Quality::HighQuality => "high_quality",
        }
    }

    /// Resolve the preset to its profile
    pub fn profile(&self) -> QualityProfile {
        match self {
            Quality::LowLatency => QualityProfile {
                chunk_size: 128,
                queue_depth: 3,
            },
            Quality::Balanced => QualityProfile {
                chunk_size: 512,
                queue_depth: 5,
            },
            Quality::HighQuality => QualityProfile {
                chunk_size: 2048,
                queue_depth: 8,
            },
        }
    }

    /// Chunk size to use, preferring an explicit override
    pub fn resolve_chunk_size(&self, explicit: Option<u32>) -> u32 {
        explicit.unwrap_or(self.profile().chunk_size)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "low_latency" => Ok(Quality::LowLatency),
            "balanced" => Ok(Quality::Balanced),
            "high_quality" => Ok(Quality::HighQuality),
            _ => Err(ConfigError::UnknownQuality(s.to_string())),
        }
    }
}

/// Concrete numbers behind a preset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    /// Frames per chunk on the wire
    pub chunk_size: u32,
    /// Frames buffered between the network reader and the sink writer
    pub queue_depth: usize,
}

impl QualityProfile {
    /// Duration of one chunk at the given sample rate
    pub fn chunk_duration(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / sample_rate.max(1) as f64)
    }

    /// Nominal buffering latency when the sink queue is full
    pub fn target_latency(&self, sample_rate: u32) -> Duration {
        self.chunk_duration(sample_rate) * self.queue_depth as u32
    }
}
