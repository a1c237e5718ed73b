//! Audio capture from input devices
//!
//! [`CaptureDevice`] is the seam between the streaming pipeline and the
//! host audio backend. [`CpalCapture`] runs the cpal stream on a dedicated
//! thread and hands fixed-size PCM16 frames to whoever calls `read`.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::device::input_device;
use crate::audio::frame::AudioFrame;
use crate::config::StreamConfig;
use crate::constants::POLL_INTERVAL;
use crate::control::Shutdown;
use crate::error::DeviceError;

/// Callback buffers queued between the audio thread and `read`
const CALLBACK_QUEUE_DEPTH: usize = 256;

/// No audio for this long means the device went away
const STALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Source of PCM16 frames.
///
/// `read` blocks until a full frame is available; capture is the natural
/// rate limiter of the client pipeline.
pub trait CaptureDevice: Send {
    /// Read exactly `frames` samples per channel
    fn read(&mut self, frames: usize) -> Result<AudioFrame, DeviceError>;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Human readable device name
    fn name(&self) -> &str;

    /// Observe `shutdown` so a blocked `read` returns `DeviceError::Stopped`
    fn attach_shutdown(&mut self, _shutdown: Shutdown) {}
}

/// cpal-backed capture for one input device
pub struct CpalCapture {
    name: String,
    sample_rate: u32,
    channels: u16,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Sample buffers from the audio callback
    samples_rx: Receiver<Vec<i16>>,

    /// Channel for stream errors
    error_rx: Receiver<DeviceError>,

    /// Samples received but not yet returned by `read`
    pending: VecDeque<i16>,

    /// Callback buffers dropped because `read` fell behind
    overflows: Arc<AtomicU64>,

    shutdown: Option<Shutdown>,
}

impl CpalCapture {
    /// Open the input device at `device_index` (default device when `None`)
    /// with the session's sample rate and channel count.
    pub fn open(device_index: Option<usize>, config: &StreamConfig) -> Result<Self, DeviceError> {
        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (samples_tx, samples_rx) = bounded::<Vec<i16>>(CALLBACK_QUEUE_DEPTH);
        let (error_tx, error_rx) = bounded::<DeviceError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<String, DeviceError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let overflows = Arc::new(AtomicU64::new(0));
        let overflows_cb = overflows.clone();

        // cpal streams are not Send on every platform, so the stream lives and
        // dies on its own thread.
        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let opened = input_device(device_index).and_then(|device| {
                    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                    let format = device
                        .default_input_config()
                        .map_err(|e| DeviceError::CpalError(e.to_string()))?
                        .sample_format();
                    let stream = build_stream(
                        &device,
                        &stream_config,
                        format,
                        samples_tx,
                        error_tx,
                        overflows_cb,
                    )?;
                    stream
                        .play()
                        .map_err(|e| DeviceError::StreamError(e.to_string()))?;
                    Ok((name, stream))
                });

                let stream = match opened {
                    Ok((name, stream)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(POLL_INTERVAL);
                }

                // Stream is dropped here, stopping capture
                drop(stream);
            })
            .map_err(|e| DeviceError::StreamError(e.to_string()))?;

        let name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(DeviceError::StreamError("capture thread exited".to_string()));
            }
        };

        tracing::info!(
            "Capture started on '{}': {} Hz, {} ch",
            name,
            config.sample_rate,
            config.channels
        );

        Ok(Self {
            name,
            sample_rate: config.sample_rate,
            channels: config.channels,
            running,
            thread_handle: Some(handle),
            samples_rx,
            error_rx,
            pending: VecDeque::new(),
            overflows,
            shutdown: None,
        })
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!("Capture on '{}' released", self.name);
        }
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Callback buffers dropped so far
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    fn cancelled(&self) -> bool {
        !self.is_running()
            || self
                .shutdown
                .as_ref()
                .map(Shutdown::is_triggered)
                .unwrap_or(false)
    }
}

impl CaptureDevice for CpalCapture {
    fn read(&mut self, frames: usize) -> Result<AudioFrame, DeviceError> {
        let wanted = frames * self.channels as usize;
        let mut last_data = Instant::now();

        while self.pending.len() < wanted {
            if let Ok(err) = self.error_rx.try_recv() {
                return Err(err);
            }
            if self.cancelled() {
                return Err(DeviceError::Stopped);
            }
            match self.samples_rx.recv_timeout(POLL_INTERVAL) {
                Ok(samples) => {
                    self.pending.extend(samples);
                    last_data = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_data.elapsed() > STALL_TIMEOUT {
                        return Err(DeviceError::StreamError(format!(
                            "no audio from '{}' for {:?}",
                            self.name, STALL_TIMEOUT
                        )));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DeviceError::Stopped),
            }
        }

        let samples: Vec<i16> = self.pending.drain(..wanted).collect();
        Ok(AudioFrame::from_samples(&samples, self.channels))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn attach_shutdown(&mut self, shutdown: Shutdown) {
        self.shutdown = Some(shutdown);
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: SampleFormat,
    samples_tx: Sender<Vec<i16>>,
    error_tx: Sender<DeviceError>,
    overflows: Arc<AtomicU64>,
) -> Result<cpal::Stream, DeviceError> {
    match format {
        SampleFormat::I16 => build_typed::<i16>(device, config, samples_tx, error_tx, overflows),
        SampleFormat::U16 => build_typed::<u16>(device, config, samples_tx, error_tx, overflows),
        SampleFormat::I32 => build_typed::<i32>(device, config, samples_tx, error_tx, overflows),
        SampleFormat::F32 => build_typed::<f32>(device, config, samples_tx, error_tx, overflows),
        other => Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples_tx: Sender<Vec<i16>>,
    error_tx: Sender<DeviceError>,
    overflows: Arc<AtomicU64>,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data.iter().map(|s| <i16 as Sample>::from_sample(*s)).collect();
                if samples_tx.try_send(samples).is_err() {
                    overflows.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| {
                let _ = error_tx.try_send(DeviceError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| DeviceError::StreamError(e.to_string()))
}

/// Capture source that replays a fixed pattern, paced to real time.
///
/// Used by tests and by the client's `--test-tone` mode.
pub struct PatternCapture {
    pattern: Vec<i16>,
    position: usize,
    sample_rate: u32,
    channels: u16,
    paced: bool,
    next_deadline: Option<Instant>,
}

impl PatternCapture {
    /// Loop `pattern` (interleaved samples) forever
    pub fn new(pattern: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            pattern: if pattern.is_empty() { vec![0] } else { pattern },
            position: 0,
            sample_rate,
            channels,
            paced: true,
            next_deadline: None,
        }
    }

    /// 440 Hz sine at a quarter of full scale
    pub fn tone(sample_rate: u32, channels: u16) -> Self {
        let period = (sample_rate / 440).max(1) as usize;
        let mut pattern = Vec::with_capacity(period * channels as usize);
        for i in 0..period {
            let phase = i as f32 / period as f32 * std::f32::consts::TAU;
            let value = (phase.sin() * 8192.0) as i16;
            for _ in 0..channels {
                pattern.push(value);
            }
        }
        Self::new(pattern, sample_rate, channels)
    }

    /// Produce frames as fast as they are read
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl CaptureDevice for PatternCapture {
    fn read(&mut self, frames: usize) -> Result<AudioFrame, DeviceError> {
        let wanted = frames * self.channels as usize;
        let mut samples = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            samples.push(self.pattern[self.position]);
            self.position = (self.position + 1) % self.pattern.len();
        }

        if self.paced {
            let frame_time = Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64);
            let deadline = self.next_deadline.unwrap_or_else(Instant::now) + frame_time;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
            self.next_deadline = Some(deadline.max(now));
        }

        Ok(AudioFrame::from_samples(&samples, self.channels))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn name(&self) -> &str {
        "test pattern"
    }
}
