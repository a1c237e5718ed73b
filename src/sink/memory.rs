//! In-memory virtual sink for pipeline tests

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::DeviceError;
use crate::sink::{ByteSink, SinkWrite, VirtualSink};

#[derive(Default)]
struct Channel {
    attached: bool,
    data: Vec<u8>,
}

/// Shared byte channel; cloning gives another handle on the same buffer
#[derive(Clone, Default)]
pub(crate) struct MemoryChannel {
    inner: Arc<Mutex<Channel>>,
}

impl MemoryChannel {
    pub fn attached() -> Self {
        let channel = Self::default();
        channel.attach();
        channel
    }

    pub fn attach(&self) {
        self.inner.lock().attached = true;
    }

    pub fn detach(&self) {
        self.inner.lock().attached = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }
}

impl ByteSink for MemoryChannel {
    fn try_write(&mut self, buf: &[u8]) -> Result<SinkWrite, DeviceError> {
        let mut inner = self.inner.lock();
        if !inner.attached {
            return Ok(SinkWrite::NoConsumer);
        }
        inner.data.extend_from_slice(buf);
        Ok(SinkWrite::Written(buf.len()))
    }
}

/// Virtual sink whose writers all feed one [`MemoryChannel`]
pub(crate) struct MemorySink {
    pub channel: MemoryChannel,
    pub destroyed: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new(channel: MemoryChannel) -> Self {
        Self {
            channel,
            destroyed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl VirtualSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn writer(&mut self) -> Result<Box<dyn ByteSink>, DeviceError> {
        Ok(Box::new(self.channel.clone()))
    }

    fn destroy(&mut self) -> Result<(), DeviceError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
