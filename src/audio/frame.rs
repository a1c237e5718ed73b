//! PCM16LE audio frames
//!
//! A frame is the unit handed between pipeline stages: `chunk_size` samples
//! per channel, interleaved, signed 16-bit little-endian. Frames carry no
//! sequence numbers; TCP keeps them in order.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

use crate::constants::BYTES_PER_SAMPLE;

/// One chunk of interleaved PCM16LE audio
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFrame {
    data: BytesMut,
    channels: u16,
}

impl AudioFrame {
    /// Wrap raw PCM16LE bytes. The length must be a whole number of samples.
    pub fn from_bytes(data: BytesMut, channels: u16) -> Self {
        debug_assert_eq!(data.len() % BYTES_PER_SAMPLE, 0);
        Self { data, channels }
    }

    /// Build from interleaved samples
    pub fn from_samples(samples: &[i16], channels: u16) -> Self {
        let mut data = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for sample in samples {
            data.put_i16_le(*sample);
        }
        Self { data, channels }
    }

    /// A frame of digital silence
    pub fn silence(chunk_size: usize, channels: u16) -> Self {
        let len = chunk_size * channels as usize * BYTES_PER_SAMPLE;
        Self {
            data: BytesMut::zeroed(len),
            channels,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of interleaved samples
    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.sample_count() / self.channels.max(1) as usize
    }

    /// Get frame duration at the given sample rate
    pub fn duration(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.samples_per_channel() as f64 / sample_rate.max(1) as f64)
    }

    /// Decode the samples
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Freeze into an immutable buffer
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}
