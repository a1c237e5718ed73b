//! Post-handshake PCM framing
//!
//! Once the handshake is accepted the stream is a plain sequence of frames,
//! each exactly `chunk_size * channels * 2` bytes. There are no length
//! prefixes; the fixed size is the framing.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::audio::frame::AudioFrame;
use crate::config::StreamConfig;
use crate::error::{Error, ProtocolViolation, TransportError};

/// Reassembles fixed-size frames from arbitrary socket reads
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    frame_bytes: usize,
    channels: u16,
    frames_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, config: &StreamConfig) -> Self {
        let frame_bytes = config.frame_bytes();
        Self {
            reader,
            buffer: BytesMut::with_capacity(frame_bytes * 2),
            frame_bytes,
            channels: config.channels,
            frames_read: 0,
        }
    }

    /// Next complete frame, `Ok(None)` on a clean end of stream.
    ///
    /// A stream that ends inside a frame is a protocol violation.
    pub async fn read_frame(&mut self) -> Result<Option<AudioFrame>, Error> {
        while self.buffer.len() < self.frame_bytes {
            self.buffer.reserve(self.frame_bytes - self.buffer.len());
            let n = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolViolation::TruncatedFrame(self.buffer.len()).into());
            }
        }

        let data = self.buffer.split_to(self.frame_bytes);
        self.frames_read += 1;
        Ok(Some(AudioFrame::from_bytes(data, self.channels)))
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }
}

/// Writes frames, checking each one against the negotiated size
pub struct FrameWriter<W> {
    writer: W,
    frame_bytes: usize,
    frames_written: u64,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, config: &StreamConfig) -> Self {
        Self {
            writer,
            frame_bytes: config.frame_bytes(),
            frames_written: 0,
            bytes_written: 0,
        }
    }

    pub async fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), Error> {
        if frame.len() != self.frame_bytes {
            return Err(ProtocolViolation::FrameSizeMismatch {
                expected: self.frame_bytes,
                got: frame.len(),
            }
            .into());
        }
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.frames_written += 1;
        self.bytes_written += frame.len() as u64;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}
