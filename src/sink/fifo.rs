//! Named pipe backing the virtual device
//!
//! The write end is opened non-blocking: opening fails with `ENXIO` while
//! nobody reads the pipe, writes fail with `EAGAIN` while the pipe is full
//! and with `EPIPE` once the reader goes away.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::error::DeviceError;
use crate::sink::{ByteSink, SinkWrite, VirtualSink};

/// Default FIFO location for a device name
pub fn fifo_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.pipe", name))
}

/// Create a FIFO at `path`, replacing whatever is there
pub fn create_fifo(path: &Path) -> Result<(), DeviceError> {
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| DeviceError::CreateFailed(format!("{}: {}", path.display(), e)))?;
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| DeviceError::CreateFailed(e.to_string()))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DeviceError::CreateFailed(format!(
            "mkfifo {}: {}",
            path.display(),
            err
        )));
    }
    tracing::info!("Created named pipe: {}", path.display());
    Ok(())
}

/// Remove the FIFO at `path` if it is one
pub fn remove_fifo(path: &Path) -> Result<(), DeviceError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            std::fs::remove_file(path)
                .map_err(|e| DeviceError::TeardownFailed(format!("{}: {}", path.display(), e)))?;
            tracing::info!("Removed named pipe: {}", path.display());
            Ok(())
        }
        Ok(_) => Err(DeviceError::TeardownFailed(format!(
            "{} is not a named pipe",
            path.display()
        ))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DeviceError::TeardownFailed(format!("{}: {}", path.display(), e))),
    }
}

/// Non-blocking write handle on a FIFO
pub struct FifoWriter {
    path: PathBuf,
    file: Option<File>,
}

impl FifoWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Whether a consumer was attached at the last write
    pub fn is_attached(&self) -> bool {
        self.file.is_some()
    }

    fn open(&mut self) -> Result<bool, DeviceError> {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
        {
            Ok(file) => {
                tracing::info!("Application attached to {}", self.path.display());
                self.file = Some(file);
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => Ok(false),
            Err(e) => Err(DeviceError::WriteFailed(format!(
                "open {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl ByteSink for FifoWriter {
    fn try_write(&mut self, buf: &[u8]) -> Result<SinkWrite, DeviceError> {
        if self.file.is_none() && !self.open()? {
            return Ok(SinkWrite::NoConsumer);
        }
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(SinkWrite::NoConsumer),
        };

        match file.write(buf) {
            Ok(n) => Ok(SinkWrite::Written(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(SinkWrite::Full)
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                tracing::warn!("Application detached from {}", self.path.display());
                self.file = None;
                Ok(SinkWrite::NoConsumer)
            }
            Err(e) => Err(DeviceError::WriteFailed(e.to_string())),
        }
    }
}

/// A bare FIFO with no audio-server registration.
///
/// For setups where something other than PulseAudio reads the pipe.
pub struct FifoSink {
    name: String,
    path: PathBuf,
    destroyed: bool,
}

impl FifoSink {
    /// Create the FIFO at the default location for `name`
    pub fn create(name: &str) -> Result<Self, DeviceError> {
        Self::create_at(name, fifo_path(name))
    }

    /// Create the FIFO at an explicit path
    pub fn create_at(name: &str, path: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let path = path.into();
        create_fifo(&path)?;
        Ok(Self {
            name: name.to_string(),
            path,
            destroyed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VirtualSink for FifoSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn writer(&mut self) -> Result<Box<dyn ByteSink>, DeviceError> {
        Ok(Box::new(FifoWriter::new(&self.path)))
    }

    fn destroy(&mut self) -> Result<(), DeviceError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        remove_fifo(&self.path)
    }
}

impl Drop for FifoSink {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("FIFO teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn temp_pipe() -> PathBuf {
        std::env::temp_dir().join(format!("mic-relay-test-{}.pipe", uuid::Uuid::new_v4()))
    }

    fn open_reader(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_no_consumer_then_attach_then_detach() {
        let path = temp_pipe();
        let mut sink = FifoSink::create_at("test", &path).unwrap();
        let mut writer = sink.writer().unwrap();

        assert_eq!(writer.try_write(&[1, 2, 3, 4]).unwrap(), SinkWrite::NoConsumer);

        let mut reader = open_reader(&path);
        assert_eq!(writer.try_write(&[1, 2, 3, 4]).unwrap(), SinkWrite::Written(4));

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        drop(reader);
        assert_eq!(writer.try_write(&[5, 6]).unwrap(), SinkWrite::NoConsumer);

        sink.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_full_pipe_reports_full() {
        let path = temp_pipe();
        let mut sink = FifoSink::create_at("test", &path).unwrap();
        let mut writer = sink.writer().unwrap();
        let _reader = open_reader(&path);

        let chunk = vec![0u8; 4096];
        let mut saw_full = false;
        for _ in 0..1024 {
            match writer.try_write(&chunk).unwrap() {
                SinkWrite::Written(_) => continue,
                SinkWrite::Full => {
                    saw_full = true;
                    break;
                }
                SinkWrite::NoConsumer => panic!("reader is attached"),
            }
        }
        assert!(saw_full);
    }

    #[test]
    fn test_create_replaces_stale_file_and_drop_cleans_up() {
        let path = temp_pipe();
        std::fs::write(&path, b"stale").unwrap();
        {
            let _sink = FifoSink::create_at("test", &path).unwrap();
            let meta = std::fs::symlink_metadata(&path).unwrap();
            assert!(meta.file_type().is_fifo());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let path = temp_pipe();
        let mut sink = FifoSink::create_at("test", &path).unwrap();
        sink.destroy().unwrap();
        sink.destroy().unwrap();
    }
}
