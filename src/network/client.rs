//! Streaming client
//!
//! Two stages joined by a bounded channel:
//!
//! ```text
//! CaptureDevice ──► capture pump (thread) ──mpsc(queue_depth)──► network task ──► TCP
//!                   gain, level check                            handshake, framing,
//!                                                                reconnect policy
//! ```
//!
//! The capture side never waits on the network for longer than the queue
//! allows; frames captured while disconnected are dropped before the next
//! session starts so the server never receives stale audio.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::capture::CaptureDevice;
use crate::audio::frame::AudioFrame;
use crate::audio::gain::apply_gain;
use crate::audio::level::LevelMonitor;
use crate::config::{ClientConfig, StreamConfig};
use crate::constants::HANDSHAKE_TIMEOUT;
use crate::control::{ClientState, Shutdown, ShutdownTrigger, StatePublisher};
use crate::error::{ConfigError, DeviceError, Error, HandshakeError, Result, TransportError};
use crate::network::framing::FrameWriter;
use crate::network::socket::connect;
use crate::protocol::{read_message, write_message, HandshakeRequest, HandshakeResponse};

/// Frames between periodic stats lines
const STATS_INTERVAL: u64 = 1000;

/// Running counters, readable while the client streams
#[derive(Debug, Default)]
pub struct ClientStats {
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_dropped: AtomicU64,
    low_level_warnings: AtomicU64,
    reconnects: AtomicU64,
}

impl ClientStats {
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Stale frames discarded before a session started
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn low_level_warnings(&self) -> u64 {
        self.low_level_warnings.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Entry point for running a client
pub struct StreamingClient;

impl StreamingClient {
    /// Start capturing from `capture` and streaming to the configured server.
    ///
    /// Must be called from within a tokio runtime. The capture device must
    /// already produce the configured format.
    pub fn start(config: ClientConfig, mut capture: Box<dyn CaptureDevice>) -> Result<ClientHandle> {
        let stream = config.stream_config()?;
        if capture.sample_rate() != stream.sample_rate || capture.channels() != stream.channels {
            return Err(ConfigError::FormatMismatch {
                got_rate: capture.sample_rate(),
                got_channels: capture.channels(),
                want_rate: stream.sample_rate,
                want_channels: stream.channels,
            }
            .into());
        }

        tracing::info!(
            "Streaming '{}' to {}: {} Hz, {} ch, {} frames/chunk ({}), volume {:.2}",
            capture.name(),
            config.server_addr(),
            stream.sample_rate,
            stream.channels,
            stream.chunk_size,
            stream.quality,
            stream.volume
        );

        let state = StatePublisher::new(ClientState::Idle);
        let (trigger, shutdown) = Shutdown::channel();
        capture.attach_shutdown(shutdown.clone());
        let stats = Arc::new(ClientStats::default());
        let (tx, rx) = mpsc::channel(stream.profile().queue_depth);
        let (done_tx, done_rx) = oneshot::channel();

        let pump = {
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            let window = config.level_window_frames;
            thread::Builder::new()
                .name("capture-pump".to_string())
                .spawn(move || {
                    let result = capture_pump(capture, stream, window, tx, shutdown, stats);
                    let _ = done_tx.send(result);
                })
                .map_err(|e| DeviceError::StreamError(format!("capture thread: {}", e)))?
        };

        let task = tokio::spawn(network_loop(
            config,
            stream,
            rx,
            done_rx,
            state.clone(),
            shutdown,
            stats.clone(),
        ));

        Ok(ClientHandle {
            state,
            trigger,
            stats,
            task: Some(task),
            pump: Some(pump),
        })
    }
}

/// Control handle for a running client
pub struct ClientHandle {
    state: StatePublisher<ClientState>,
    trigger: ShutdownTrigger,
    stats: Arc<ClientStats>,
    task: Option<JoinHandle<ClientState>>,
    pump: Option<thread::JoinHandle<()>>,
}

impl ClientHandle {
    pub fn status(&self) -> ClientState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Ask the client to stop; returns immediately
    pub fn stop(&self) {
        self.trigger.trigger();
    }

    /// Wait for the client to finish and return its final state. The
    /// socket and the capture device are released by the time this returns.
    pub async fn join(mut self) -> ClientState {
        let final_state = match self.task.take() {
            Some(task) => task
                .await
                .unwrap_or_else(|e| ClientState::Error(format!("network task: {}", e))),
            None => self.state.get(),
        };

        // The network task is gone, so the pump's next send fails
        self.trigger.trigger();
        if let Some(pump) = self.pump.take() {
            let joined = tokio::task::spawn_blocking(move || pump.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!("Capture thread did not exit cleanly");
            }
        }
        final_state
    }

    /// `stop` followed by `join`
    pub async fn shutdown(self) -> ClientState {
        self.stop();
        self.join().await
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.trigger.trigger();
    }
}

/// Capture loop: read, apply gain, check level, hand to the network task
fn capture_pump(
    mut capture: Box<dyn CaptureDevice>,
    config: StreamConfig,
    level_window: usize,
    frames: mpsc::Sender<AudioFrame>,
    shutdown: Shutdown,
    stats: Arc<ClientStats>,
) -> std::result::Result<(), DeviceError> {
    let chunk = config.chunk_size as usize;
    let mut level = LevelMonitor::new(level_window);

    while !shutdown.is_triggered() {
        let frame = match capture.read(chunk) {
            Ok(frame) => frame,
            Err(DeviceError::Stopped) => break,
            Err(e) => {
                tracing::error!("Capture failed: {}", e);
                return Err(e);
            }
        };
        let frame = apply_gain(frame, config.volume);
        stats.frames_captured.fetch_add(1, Ordering::Relaxed);

        if let Some(warning) = level.observe(&frame) {
            stats.low_level_warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Input level very low (peak {}, rms {:.4}); check the microphone and its gain",
                warning.peak,
                warning.rms
            );
        }

        if frames.blocking_send(frame).is_err() {
            break;
        }
    }

    tracing::debug!("Capture pump exiting");
    Ok(())
}

async fn network_loop(
    config: ClientConfig,
    stream: StreamConfig,
    mut frames: mpsc::Receiver<AudioFrame>,
    mut capture_done: oneshot::Receiver<std::result::Result<(), DeviceError>>,
    state: StatePublisher<ClientState>,
    mut shutdown: Shutdown,
    stats: Arc<ClientStats>,
) -> ClientState {
    let policy = config.reconnect.clone();
    let mut failures: u32 = 0;

    let final_state = loop {
        let outcome = tokio::select! {
            _ = shutdown.wait() => break ClientState::Stopped,
            done = &mut capture_done => break capture_end(done.ok()),
            r = run_connection(&config, &stream, &mut frames, &state, &stats, &mut failures) => r,
        };

        match outcome {
            Ok(()) => {
                // Capture side closed the channel
                let done = (&mut capture_done).await.ok();
                break capture_end(done);
            }
            Err(e) if e.is_retryable() => {
                state.set(ClientState::Disconnected);
                failures += 1;
                if !policy.allows(failures) {
                    tracing::error!("Connection lost: {}", e);
                    break ClientState::Error(if policy.enabled {
                        format!("giving up after {} attempts: {}", failures, e)
                    } else {
                        e.to_string()
                    });
                }

                let delay = policy.backoff(failures);
                tracing::warn!(
                    "Connection lost: {}. Reconnecting in {:.1}s (attempt {})",
                    e,
                    delay.as_secs_f32(),
                    failures
                );
                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    _ = shutdown.wait() => break ClientState::Stopped,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                tracing::error!("Streaming failed: {}", e);
                break ClientState::Error(e.to_string());
            }
        }
    };

    state.set(final_state.clone());
    tracing::info!(
        "Client finished: {} frames sent ({:.1} KB), {} stale frames dropped, {} reconnects",
        stats.frames_sent(),
        stats.bytes_sent() as f64 / 1024.0,
        stats.frames_dropped(),
        stats.reconnects()
    );
    final_state
}

fn capture_end(result: Option<std::result::Result<(), DeviceError>>) -> ClientState {
    match result {
        Some(Err(e)) => ClientState::Error(format!("capture: {}", e)),
        Some(Ok(())) => ClientState::Stopped,
        None => ClientState::Error("capture thread exited unexpectedly".to_string()),
    }
}

/// One connection: connect, handshake, stream until error or capture end
async fn run_connection(
    config: &ClientConfig,
    stream: &StreamConfig,
    frames: &mut mpsc::Receiver<AudioFrame>,
    state: &StatePublisher<ClientState>,
    stats: &ClientStats,
    failures: &mut u32,
) -> Result<()> {
    state.set(ClientState::Connecting);
    let mut socket = connect(&config.server_addr(), config.connect_timeout()).await?;

    state.set(ClientState::Handshaking);
    handshake(&mut socket, stream).await?;
    *failures = 0;

    let mut stale = 0u64;
    while frames.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        stats.frames_dropped.fetch_add(stale, Ordering::Relaxed);
        tracing::debug!("Dropped {} stale frames", stale);
    }

    state.set(ClientState::Streaming);
    tracing::info!("Connected to {}, streaming", config.server_addr());

    let write_timeout = config.write_timeout();
    let mut writer = FrameWriter::new(socket, stream);
    while let Some(frame) = frames.recv().await {
        match tokio::time::timeout(write_timeout, writer.write_frame(&frame)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout.into()),
        }

        let sent = stats.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
        stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        if sent % STATS_INTERVAL == 0 {
            tracing::debug!(
                "Sent {} frames ({:.1} KB)",
                sent,
                stats.bytes_sent() as f64 / 1024.0
            );
        }
    }
    Ok(())
}

/// Send the stream parameters and wait for the server's verdict
async fn handshake(socket: &mut TcpStream, stream: &StreamConfig) -> Result<()> {
    let request = HandshakeRequest::from(stream);
    let exchange = async {
        write_message(&mut *socket, &request).await?;
        read_message::<_, HandshakeResponse>(&mut *socket).await
    };
    let response = match tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange).await {
        Ok(response) => response?,
        Err(_) => return Err(HandshakeError::Timeout.into()),
    };

    match response {
        HandshakeResponse::Accepted => Ok(()),
        HandshakeResponse::Rejected { reason } => {
            tracing::error!("Server rejected the stream: {}", reason);
            Err(Error::Handshake(HandshakeError::Rejected(reason)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::PatternCapture;
    use crate::config::{ReconnectPolicy, ServerConfig};
    use crate::control::wait_for;
    use crate::network::framing::FrameReader;
    use crate::network::server::StreamingServer;
    use crate::quality::Quality;
    use crate::sink::memory::{MemoryChannel, MemorySink};
    use std::time::Duration;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    fn client_config(port: u16) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            sample_rate: 44100,
            channels: 1,
            chunk_size: Some(128),
            quality: Quality::LowLatency,
            reconnect: ReconnectPolicy {
                enabled: true,
                max_attempts: 0,
                initial_backoff_ms: 10,
                max_backoff_ms: 50,
            },
            connect_timeout_ms: 1000,
            ..Default::default()
        }
    }

    fn tone() -> Box<dyn CaptureDevice> {
        Box::new(PatternCapture::tone(44100, 1))
    }

    async fn reach(handle: &ClientHandle, want: ClientState) -> bool {
        let mut rx = handle.subscribe();
        wait_for(&mut rx, WAIT, |s| *s == want).await.is_some()
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Accept one connection and acknowledge its handshake
    async fn accept_session(listener: &TcpListener) -> (TcpStream, HandshakeRequest) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request: HandshakeRequest = read_message(&mut stream).await.unwrap();
        write_message(&mut stream, &HandshakeResponse::Accepted).await.unwrap();
        (stream, request)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_end_to_end_with_server() {
        let channel = MemoryChannel::attached();
        let server = StreamingServer::start(
            ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 0,
                ..Default::default()
            },
            Box::new(MemorySink::new(channel.clone())),
        )
        .await
        .unwrap();

        let config = ClientConfig {
            volume: 0.5,
            ..client_config(server.local_addr().port())
        };
        let capture = Box::new(PatternCapture::new(vec![1000], 44100, 1));
        let client = StreamingClient::start(config, capture).unwrap();
        assert!(reach(&client, ClientState::Streaming).await);

        let frame_bytes = 128 * 2;
        for _ in 0..100 {
            if channel.len() >= frame_bytes * 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(client.shutdown().await, ClientState::Stopped);

        let mut rx = server.subscribe();
        assert!(wait_for(&mut rx, WAIT, |s| *s == crate::control::ServerState::Listening)
            .await
            .is_some());

        let data = channel.contents();
        assert!(data.len() >= frame_bytes * 4);
        assert_eq!(data.len() % frame_bytes, 0);
        let samples: Vec<i16> = data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert!(samples.iter().all(|&s| s == 500));

        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handshake_carries_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = client_config(listener.local_addr().unwrap().port());
        let client = StreamingClient::start(config, tone()).unwrap();

        let (stream, request) = accept_session(&listener).await;
        assert_eq!(request.sample_rate, 44100);
        assert_eq!(request.channels, 1);
        assert_eq!(request.chunk_size, 128);
        assert_eq!(request.quality, Quality::LowLatency);

        let stream_config = request.into_config().unwrap();
        let mut reader = FrameReader::new(stream, &stream_config);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.len(), 256);

        assert_eq!(client.shutdown().await, ClientState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = client_config(listener.local_addr().unwrap().port());
        let client = StreamingClient::start(config, tone()).unwrap();

        let (stream, request) = accept_session(&listener).await;
        let stream_config = request.into_config().unwrap();
        let mut reader = FrameReader::new(stream, &stream_config);
        reader.read_frame().await.unwrap().unwrap();
        drop(reader);

        let (stream, _) = accept_session(&listener).await;
        let mut reader = FrameReader::new(stream, &stream_config);
        assert!(reader.read_frame().await.unwrap().is_some());
        assert!(reach(&client, ClientState::Streaming).await);
        assert!(client.stats().reconnects() >= 1);

        assert_eq!(client.shutdown().await, ClientState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_gives_up_after_max_attempts() {
        let mut config = client_config(closed_port().await);
        config.reconnect.max_attempts = 2;
        let client = StreamingClient::start(config, tone()).unwrap();

        let final_state = tokio::time::timeout(WAIT, client.join()).await.unwrap();
        match final_state {
            ClientState::Error(reason) => assert!(reason.contains("giving up after 3 attempts")),
            other => panic!("unexpected final state: {}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_reconnect_fails_once() {
        let mut config = client_config(closed_port().await);
        config.reconnect = ReconnectPolicy::disabled();
        let client = StreamingClient::start(config, tone()).unwrap();

        let final_state = tokio::time::timeout(WAIT, client.join()).await.unwrap();
        assert!(matches!(final_state, ClientState::Error(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejection_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = client_config(listener.local_addr().unwrap().port());
        let client = StreamingClient::start(config, tone()).unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        let _: HandshakeRequest = read_message(&mut stream).await.unwrap();
        write_message(&mut stream, &HandshakeResponse::rejected("server busy"))
            .await
            .unwrap();

        let final_state = tokio::time::timeout(WAIT, client.join()).await.unwrap();
        match final_state {
            ClientState::Error(reason) => assert!(reason.contains("server busy")),
            other => panic!("unexpected final state: {}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_during_backoff() {
        let mut config = client_config(closed_port().await);
        config.reconnect.initial_backoff_ms = 60_000;
        config.reconnect.max_backoff_ms = 60_000;
        let client = StreamingClient::start(config, tone()).unwrap();

        assert!(reach(&client, ClientState::Disconnected).await);
        let final_state = tokio::time::timeout(WAIT, client.shutdown()).await.unwrap();
        assert_eq!(final_state, ClientState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capture_format_must_match() {
        let capture = Box::new(PatternCapture::tone(48000, 2));
        let result = StreamingClient::start(client_config(5000), capture);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::FormatMismatch { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_low_input_level_is_counted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig {
            level_window_frames: 5,
            ..client_config(listener.local_addr().unwrap().port())
        };
        let capture = Box::new(PatternCapture::new(vec![3], 44100, 1).unpaced());
        let client = StreamingClient::start(config, capture).unwrap();

        let (stream, request) = accept_session(&listener).await;
        let mut reader = FrameReader::new(stream, &request.into_config().unwrap());
        for _ in 0..20 {
            reader.read_frame().await.unwrap().unwrap();
        }
        assert!(client.stats().low_level_warnings() >= 1);
        assert_eq!(client.shutdown().await, ClientState::Stopped);
    }
}
