//! Sink writer
//!
//! Drains frames handed up by a server session into the virtual device, in
//! order. A missing consumer is a normal condition: the writer parks in
//! `WaitingForConsumer` and resumes with the same frame once an
//! application attaches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::frame::AudioFrame;
use crate::audio::gain::apply_gain;
use crate::constants::POLL_INTERVAL;
use crate::control::{ServerState, Shutdown, StatePublisher};
use crate::error::DeviceError;
use crate::sink::{ByteSink, SinkWrite};

/// Back-off while a consumer is attached but behind
const FULL_BACKOFF: Duration = Duration::from_millis(2);

/// Frames between periodic stats lines
const STATS_INTERVAL: u64 = 1000;

/// Counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub frames_written: u64,
    pub bytes_written: u64,
    /// Frames dropped because the session ended with no consumer attached
    pub frames_discarded: u64,
    /// Times the writer had to wait for a consumer
    pub stalls: u64,
}

enum FrameOutcome {
    Written,
    /// Shutdown, or session over with nobody listening
    Abandoned,
}

/// Writes one session's frames into a [`ByteSink`]
pub struct SinkWriter {
    sink: Box<dyn ByteSink>,
    volume: f32,
    state: StatePublisher<ServerState>,
    shutdown: Shutdown,
    session_open: Arc<AtomicBool>,
    waiting: bool,
    stats: WriterStats,
}

impl SinkWriter {
    /// `session_open` is cleared by the session reader when the client is
    /// gone; frames still stuck behind a missing consumer are then dropped.
    pub fn new(
        sink: Box<dyn ByteSink>,
        volume: f32,
        state: StatePublisher<ServerState>,
        shutdown: Shutdown,
        session_open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sink,
            volume,
            state,
            shutdown,
            session_open,
            waiting: false,
            stats: WriterStats::default(),
        }
    }

    /// Drain `frames` until the sender side closes. Blocking; run it on a
    /// blocking thread.
    pub fn run(mut self, mut frames: mpsc::Receiver<AudioFrame>) -> Result<WriterStats, DeviceError> {
        while let Some(frame) = frames.blocking_recv() {
            let frame = apply_gain(frame, self.volume);
            match self.write_frame(frame.as_bytes()) {
                Ok(FrameOutcome::Written) => {
                    self.stats.frames_written += 1;
                    self.stats.bytes_written += frame.len() as u64;
                    if self.stats.frames_written % STATS_INTERVAL == 0 {
                        tracing::debug!(
                            "Relayed {} frames ({:.1} KB)",
                            self.stats.frames_written,
                            self.stats.bytes_written as f64 / 1024.0
                        );
                    }
                }
                Ok(FrameOutcome::Abandoned) => {
                    frames.close();
                    self.stats.frames_discarded += 1;
                    while frames.try_recv().is_ok() {
                        self.stats.frames_discarded += 1;
                    }
                    tracing::info!(
                        "Discarded {} undelivered frames (no application attached)",
                        self.stats.frames_discarded
                    );
                    break;
                }
                Err(e) => {
                    frames.close();
                    return Err(e);
                }
            }
        }
        Ok(self.stats)
    }

    fn write_frame(&mut self, buf: &[u8]) -> Result<FrameOutcome, DeviceError> {
        let mut offset = 0;
        while offset < buf.len() {
            if self.shutdown.is_triggered() {
                return Ok(FrameOutcome::Abandoned);
            }
            match self.sink.try_write(&buf[offset..])? {
                SinkWrite::Written(n) => {
                    offset += n;
                    if self.waiting {
                        self.waiting = false;
                        tracing::info!("Application attached, relaying audio");
                    }
                    self.state.set(ServerState::Relaying);
                }
                SinkWrite::NoConsumer => {
                    if !self.waiting {
                        self.waiting = true;
                        self.stats.stalls += 1;
                        tracing::info!(
                            "Waiting for an application to open the virtual device..."
                        );
                        self.state.set(ServerState::WaitingForConsumer);
                    }
                    if !self.session_open.load(Ordering::Acquire) {
                        return Ok(FrameOutcome::Abandoned);
                    }
                    // A new consumer gets the whole frame, not a tail
                    offset = 0;
                    thread::sleep(POLL_INTERVAL);
                }
                SinkWrite::Full => thread::sleep(FULL_BACKOFF),
            }
        }
        Ok(FrameOutcome::Written)
    }
}
