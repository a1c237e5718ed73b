//! Virtual sink subsystem
//!
//! The server feeds received audio into a [`ByteSink`] obtained from a
//! [`VirtualSink`]. On Linux the sink is a named pipe registered with
//! PulseAudio as a `module-pipe-source`, so applications see it as a
//! microphone.

#[cfg(unix)]
pub mod fifo;
#[cfg(test)]
pub(crate) mod memory;
#[cfg(unix)]
pub mod pulse;
pub mod writer;

#[cfg(unix)]
pub use fifo::{FifoSink, FifoWriter};
#[cfg(unix)]
pub use pulse::PulsePipeSource;
pub use writer::{SinkWriter, WriterStats};

use crate::error::DeviceError;

/// Outcome of a non-blocking write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkWrite {
    /// This many bytes were accepted (may be fewer than offered)
    Written(usize),
    /// No application is reading the device
    NoConsumer,
    /// A consumer is attached but has not drained the channel yet
    Full,
}

/// Write end of the virtual device's byte channel.
///
/// Writes never block; the caller decides how to wait, which keeps the
/// writer cancellable and makes the "waiting for application" state visible.
pub trait ByteSink: Send {
    fn try_write(&mut self, buf: &[u8]) -> Result<SinkWrite, DeviceError>;
}

/// An OS-level virtual input device.
///
/// Implementations are created by their constructor (which registers the
/// device) and must tolerate `destroy` being called more than once; `Drop`
/// should call it as well.
pub trait VirtualSink: Send {
    /// Name applications see
    fn name(&self) -> &str;

    /// Open a fresh write handle for one session
    fn writer(&mut self) -> Result<Box<dyn ByteSink>, DeviceError>;

    /// Remove the device registration and any backing artifact
    fn destroy(&mut self) -> Result<(), DeviceError>;
}

impl<T: VirtualSink + ?Sized> VirtualSink for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn writer(&mut self) -> Result<Box<dyn ByteSink>, DeviceError> {
        (**self).writer()
    }

    fn destroy(&mut self) -> Result<(), DeviceError> {
        (**self).destroy()
    }
}
