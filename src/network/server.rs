//! Streaming server
//!
//! Accepts one client at a time, validates its handshake against the
//! virtual device format and relays the PCM stream into the sink. A client
//! connecting while a session is active gets `Rejected("server busy")`.
//!
//! Per session two stages run concurrently:
//!
//! ```text
//! socket ──► FrameReader (async task) ──mpsc(queue_depth)──► SinkWriter (blocking thread) ──► FIFO
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::audio::frame::AudioFrame;
use crate::config::{ServerConfig, StreamConfig};
use crate::constants::STALL_BACKLOG;
use crate::control::{ServerState, Shutdown, ShutdownTrigger, StatePublisher};
use crate::error::{Error, HandshakeError, Result, TransportError};
use crate::network::framing::FrameReader;
use crate::network::socket::{bind_listener, resolve, tune_stream};
use crate::protocol::{read_message, write_message, HandshakeRequest, HandshakeResponse};
use crate::sink::{ByteSink, SinkWriter, VirtualSink, WriterStats};

/// Reason sent to a client that connects while another one streams
pub const BUSY_REASON: &str = "server busy";

/// Reason sent when the virtual device cannot be opened for writing
pub const DEVICE_UNAVAILABLE_REASON: &str = "virtual device unavailable";

/// The session currently bound to the server
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
    pub config: StreamConfig,
}

#[derive(Default)]
struct Slot {
    /// Held from accept until the session has fully wound down
    busy: bool,
    info: Option<SessionInfo>,
}

/// State shared between the accept loop and session tasks
struct Shared {
    config: ServerConfig,
    state: StatePublisher<ServerState>,
    slot: Mutex<Slot>,
}

impl Shared {
    /// Take the single session slot. State changes happen under the lock so
    /// a finishing session can never overwrite its successor's state.
    fn claim(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.busy {
            return false;
        }
        slot.busy = true;
        self.state.set(ServerState::Handshaking);
        true
    }

    fn bind(&self, info: SessionInfo) {
        self.slot.lock().info = Some(info);
        self.state.set(ServerState::Relaying);
    }

    fn release(&self) {
        self.finish(ServerState::Listening);
    }

    /// Free the slot but keep the failure visible until the next client
    fn fail(&self, reason: String) {
        self.finish(ServerState::Error(reason));
    }

    fn finish(&self, state: ServerState) {
        let mut slot = self.slot.lock();
        slot.busy = false;
        slot.info = None;
        self.state.set(state);
    }
}

/// Frames read ahead while the writer queue is full. The socket keeps being
/// read during a consumer stall so a client disconnect is still noticed.
struct Backlog {
    frames: VecDeque<AudioFrame>,
    capacity: usize,
    dropped: u64,
}

impl Backlog {
    fn new(config: &StreamConfig) -> Self {
        let frames = STALL_BACKLOG.as_secs_f64() / config.frame_duration().as_secs_f64();
        Self {
            frames: VecDeque::new(),
            capacity: (frames.ceil() as usize).max(1),
            dropped: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn push(&mut self, frame: AudioFrame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
            if self.dropped == 1 {
                tracing::warn!(
                    "No application read the device for {:?}, dropping the oldest audio",
                    STALL_BACKLOG
                );
            }
        }
        self.frames.push_back(frame);
    }

    fn pop(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Entry point for running a server
pub struct StreamingServer;

impl StreamingServer {
    /// Validate `config`, bind the listener and start accepting.
    ///
    /// The sink must already exist; it is destroyed when the server stops.
    pub async fn start(mut config: ServerConfig, sink: Box<dyn VirtualSink>) -> Result<ServerHandle> {
        config.validate()?;
        let addr = resolve(&config.listen_addr())
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            "Listening on {} for '{}' ({} Hz, {} ch)",
            local_addr,
            sink.name(),
            config.sample_rate,
            config.channels
        );

        let shared = Arc::new(Shared {
            config,
            state: StatePublisher::new(ServerState::Listening),
            slot: Mutex::new(Slot::default()),
        });
        let (trigger, shutdown) = Shutdown::channel();

        let task = tokio::spawn(accept_loop(listener, sink, shared.clone(), shutdown));

        Ok(ServerHandle {
            local_addr,
            shared,
            trigger,
            task: Some(task),
        })
    }
}

/// Control handle for a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    trigger: ShutdownTrigger,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> ServerState {
        self.shared.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.shared.state.subscribe()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.shared.slot.lock().info.clone()
    }

    /// Ask the server to stop; returns immediately
    pub fn stop(&self) {
        self.trigger.trigger();
    }

    /// Wait until the accept loop, any session and the sink teardown are done
    pub async fn join(mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| TransportError::ReceiveFailed(format!("server task: {}", e)))?;
        }
        Ok(())
    }

    /// `stop` followed by `join`
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.join().await
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.trigger.trigger();
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut sink: Box<dyn VirtualSink>,
    shared: Arc<Shared>,
    shutdown: Shutdown,
) {
    let mut stop = shutdown.clone();
    let mut active: Option<JoinHandle<()>> = None;

    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        if !shared.claim() {
            tracing::warn!("Rejecting {}: a session is already active", peer);
            let timeout = shared.config.handshake_timeout();
            tokio::spawn(async move {
                if let Err(e) = reject(stream, BUSY_REASON, timeout).await {
                    tracing::debug!("Busy rejection to {} failed: {}", peer, e);
                }
            });
            continue;
        }

        tracing::info!("Connection from {}", peer);
        let writer = match sink.writer() {
            Ok(writer) => writer,
            Err(e) => {
                tracing::error!("Cannot open virtual device for writing: {}", e);
                let timeout = shared.config.handshake_timeout();
                tokio::spawn(async move {
                    if let Err(e) = reject(stream, DEVICE_UNAVAILABLE_REASON, timeout).await {
                        tracing::debug!("Rejection to {} failed: {}", peer, e);
                    }
                });
                shared.fail(format!("{}: {}", DEVICE_UNAVAILABLE_REASON, e));
                continue;
            }
        };

        let id = Uuid::new_v4();
        let span = tracing::info_span!("session", %peer, id = %id.simple());
        let session_shared = shared.clone();
        let session_shutdown = shutdown.clone();
        active = Some(tokio::spawn(
            async move {
                match run_session(stream, peer, id, writer, &session_shared, session_shutdown).await {
                    Ok(stats) => {
                        tracing::info!(
                            "Session closed: {} frames relayed, {} discarded",
                            stats.frames_written,
                            stats.frames_discarded
                        );
                        session_shared.release();
                    }
                    Err(Error::Device(e)) => {
                        tracing::error!("Virtual device failed: {}", e);
                        session_shared.fail(e.to_string());
                    }
                    Err(Error::Config(e)) => {
                        tracing::warn!("Rejected session: {}", e);
                        session_shared.release();
                    }
                    Err(e) => {
                        tracing::warn!("Session ended: {}", e);
                        session_shared.release();
                    }
                }
            }
            .instrument(span),
        ));
    }

    drop(listener);
    if let Some(task) = active {
        if let Err(e) = task.await {
            tracing::warn!("Session task failed: {}", e);
        }
    }

    if let Err(e) = sink.destroy() {
        tracing::warn!("Virtual device teardown failed: {}", e);
    }
    shared.state.set(ServerState::Stopped);
    tracing::info!("Server stopped");
}

/// Read the peer's handshake (so it is not reset mid-write), then refuse it
async fn reject(mut stream: TcpStream, reason: &str, timeout: std::time::Duration) -> Result<()> {
    let _ = tokio::time::timeout(timeout, read_message::<_, HandshakeRequest>(&mut stream)).await;
    write_message(&mut stream, &HandshakeResponse::rejected(reason)).await?;
    Ok(())
}

/// Read and validate the request. Only rejections are answered here; the
/// caller acknowledges once the session is bound.
async fn handshake(stream: &mut TcpStream, shared: &Shared) -> Result<StreamConfig> {
    let request: HandshakeRequest =
        match tokio::time::timeout(shared.config.handshake_timeout(), read_message(stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(HandshakeError::Timeout.into()),
        };
    tracing::debug!("Handshake request: {:?}", request);

    let config = request
        .into_config()
        .and_then(|config| shared.config.check_format(&config).map(|_| config));

    match config {
        Ok(config) => Ok(config),
        Err(e) => {
            write_message(stream, &HandshakeResponse::rejected(e.to_string())).await?;
            Err(e.into())
        }
    }
}

async fn run_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    id: Uuid,
    sink: Box<dyn ByteSink>,
    shared: &Shared,
    mut shutdown: Shutdown,
) -> Result<WriterStats> {
    tune_stream(&stream, true)?;

    let config = handshake(&mut stream, shared).await?;
    let profile = config.profile();
    tracing::info!(
        "Session accepted: {} Hz, {} ch, {} frames/chunk ({}), queue depth {}",
        config.sample_rate,
        config.channels,
        config.chunk_size,
        config.quality,
        profile.queue_depth
    );

    shared.bind(SessionInfo {
        id,
        peer,
        started_at: Utc::now(),
        config,
    });
    write_message(&mut stream, &HandshakeResponse::Accepted).await?;

    let session_open = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel(profile.queue_depth);
    let writer = SinkWriter::new(
        sink,
        shared.config.volume,
        shared.state.clone(),
        shutdown.clone(),
        session_open.clone(),
    );
    let writer_task = tokio::task::spawn_blocking(move || writer.run(rx));

    let mut reader = FrameReader::new(stream, &config);
    let mut backlog = Backlog::new(&config);
    let outcome: Result<()> = loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => {
                tracing::info!("Shutdown requested, closing session");
                break Ok(());
            }
            // Writer gave up; its result says why
            _ = tx.closed() => break Ok(()),
            permit = tx.reserve(), if !backlog.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(frame) = backlog.pop() {
                        permit.send(frame);
                    }
                }
                Err(_) => break Ok(()),
            },
            frame = reader.read_frame() => match frame {
                Ok(Some(frame)) if backlog.is_empty() => match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(frame)) => backlog.push(frame),
                    Err(TrySendError::Closed(_)) => break Ok(()),
                },
                Ok(Some(frame)) => backlog.push(frame),
                Ok(None) => {
                    tracing::info!("Client disconnected after {} frames", reader.frames_read());
                    break Ok(());
                }
                Err(e) => break Err(e),
            },
        }
    };

    // From here the writer drops frames that have no consumer to go to
    session_open.store(false, Ordering::Release);
    let mut undelivered = backlog.dropped;
    while let Some(frame) = backlog.pop() {
        let sent = tokio::select! {
            biased;
            _ = shutdown.wait() => false,
            sent = tx.send(frame) => sent.is_ok(),
        };
        if !sent {
            undelivered += 1;
            break;
        }
    }
    undelivered += backlog.len() as u64;
    drop(tx);

    let mut stats = writer_task
        .await
        .map_err(|e| TransportError::ReceiveFailed(format!("sink writer: {}", e)))??;
    stats.frames_discarded += undelivered;

    outcome.map(|_| stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioFrame;
    use crate::control::wait_for;
    use crate::network::framing::FrameWriter;
    use crate::error::DeviceError;
    use crate::quality::Quality;
    use crate::sink::memory::{MemoryChannel, MemorySink};
    use crate::sink::SinkWrite;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const WAIT: Duration = Duration::from_secs(5);

    fn server_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            sample_rate: 44100,
            channels: 1,
            handshake_timeout_ms: 2000,
            ..Default::default()
        }
    }

    async fn start(channel: &MemoryChannel) -> (ServerHandle, Arc<std::sync::atomic::AtomicUsize>) {
        let sink = MemorySink::new(channel.clone());
        let destroyed = sink.destroyed.clone();
        let handle = StreamingServer::start(server_config(), Box::new(sink))
            .await
            .unwrap();
        (handle, destroyed)
    }

    fn request(config: &StreamConfig) -> HandshakeRequest {
        HandshakeRequest::from(config)
    }

    async fn open(addr: SocketAddr, req: HandshakeRequest) -> (TcpStream, HandshakeResponse) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &req).await.unwrap();
        let response = read_message(&mut stream).await.unwrap();
        (stream, response)
    }

    fn frames(config: &StreamConfig, count: usize) -> Vec<AudioFrame> {
        (0..count)
            .map(|i| AudioFrame::from_samples(&vec![i as i16 * 3 + 1; config.samples_per_frame()], 1))
            .collect()
    }

    async fn wait_state(handle: &ServerHandle, want: ServerState) -> bool {
        let mut rx = handle.subscribe();
        wait_for(&mut rx, WAIT, |s| *s == want).await.is_some()
    }

    async fn wait_error(handle: &ServerHandle) -> Option<String> {
        let mut rx = handle.subscribe();
        match wait_for(&mut rx, WAIT, |s| matches!(s, ServerState::Error(_))).await {
            Some(ServerState::Error(reason)) => Some(reason),
            _ => None,
        }
    }

    async fn wait_len(channel: &MemoryChannel, len: usize) -> bool {
        tokio::time::timeout(WAIT, async {
            while channel.len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Virtual device that cannot be opened, or whose writes fail
    struct BrokenSink {
        open_fails: bool,
    }

    struct FailingWriter;

    impl ByteSink for FailingWriter {
        fn try_write(&mut self, _buf: &[u8]) -> std::result::Result<SinkWrite, DeviceError> {
            Err(DeviceError::WriteFailed("pipe removed".to_string()))
        }
    }

    impl VirtualSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        fn writer(&mut self) -> std::result::Result<Box<dyn ByteSink>, DeviceError> {
            if self.open_fails {
                return Err(DeviceError::WriteFailed("no pipe".to_string()));
            }
            Ok(Box::new(FailingWriter))
        }

        fn destroy(&mut self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_relays_frames_in_order() {
        let channel = MemoryChannel::attached();
        let (server, _) = start(&channel).await;
        let config = StreamConfig::new(44100, 1, Some(64), Quality::LowLatency, 1.0).unwrap();

        let (stream, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);

        let input = frames(&config, 25);
        let mut writer = FrameWriter::new(stream, &config);
        for frame in &input {
            writer.write_frame(frame).await.unwrap();
        }
        assert!(wait_state(&server, ServerState::Relaying).await);
        let info = server.session().unwrap();
        assert_eq!(info.config, config);
        drop(writer);

        assert!(wait_state(&server, ServerState::Listening).await);
        let expected: Vec<u8> = input.iter().flat_map(|f| f.as_bytes().to_vec()).collect();
        assert_eq!(channel.contents(), expected);
        assert!(server.session().is_none());

        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_handshake_rejected_before_any_frame() {
        let channel = MemoryChannel::attached();
        let (server, _) = start(&channel).await;
        let valid = StreamConfig::default();

        let mut zero_chunk = request(&valid);
        zero_chunk.chunk_size = 0;
        let (_s, response) = open(server.local_addr(), zero_chunk).await;
        assert!(matches!(response, HandshakeResponse::Rejected { ref reason } if reason.contains("chunk size")));

        assert!(wait_state(&server, ServerState::Listening).await);

        let mut zero_rate = request(&valid);
        zero_rate.sample_rate = 0;
        let (_s, response) = open(server.local_addr(), zero_rate).await;
        assert!(matches!(response, HandshakeResponse::Rejected { ref reason } if reason.contains("sample rate")));

        assert!(wait_state(&server, ServerState::Listening).await);
        assert_eq!(channel.len(), 0);
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_format_mismatch_rejected() {
        let channel = MemoryChannel::attached();
        let (server, _) = start(&channel).await;
        let stereo = StreamConfig::new(48000, 2, None, Quality::Balanced, 1.0).unwrap();

        let (_s, response) = open(server.local_addr(), request(&stereo)).await;
        assert!(matches!(response, HandshakeResponse::Rejected { .. }));
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_connection_rejected_while_active() {
        let channel = MemoryChannel::attached();
        let (server, _) = start(&channel).await;
        let config = StreamConfig::default();

        let (first, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);
        let first_id = server.session().unwrap().id;
        let state_before = server.status();
        assert!(state_before.has_session());

        let (_second, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::rejected(BUSY_REASON));

        // The active session is untouched
        assert_eq!(server.session().unwrap().id, first_id);
        assert!(server.status().has_session());

        let mut writer = FrameWriter::new(first, &config);
        writer.write_frame(&frames(&config, 1)[0]).await.unwrap();
        drop(writer);
        assert!(wait_state(&server, ServerState::Listening).await);

        // Free again once the first client left
        let (_third, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stall_waits_for_consumer_without_drops() {
        let channel = MemoryChannel::default();
        let (server, _) = start(&channel).await;
        let config = StreamConfig::new(44100, 1, Some(128), Quality::LowLatency, 1.0).unwrap();

        let (stream, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);

        let input = frames(&config, 3);
        let mut writer = FrameWriter::new(stream, &config);
        for frame in &input {
            writer.write_frame(frame).await.unwrap();
        }

        assert!(wait_state(&server, ServerState::WaitingForConsumer).await);
        assert_eq!(channel.len(), 0);

        channel.attach();
        assert!(wait_state(&server, ServerState::Relaying).await);
        drop(writer);

        assert!(wait_state(&server, ServerState::Listening).await);
        let expected: Vec<u8> = input.iter().flat_map(|f| f.as_bytes().to_vec()).collect();
        assert_eq!(channel.contents(), expected);
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_during_stall_returns_to_listening() {
        let channel = MemoryChannel::default();
        let (server, _) = start(&channel).await;
        let config = StreamConfig::new(44100, 1, Some(128), Quality::LowLatency, 1.0).unwrap();
        let depth = config.profile().queue_depth;

        let (stream, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);

        // More than the writer and its queue can hold
        let mut writer = FrameWriter::new(stream, &config);
        for frame in &frames(&config, depth + 7) {
            writer.write_frame(frame).await.unwrap();
        }
        assert!(wait_state(&server, ServerState::WaitingForConsumer).await);
        drop(writer);

        assert!(wait_state(&server, ServerState::Listening).await);
        assert!(server.session().is_none());
        assert_eq!(channel.len(), 0);

        let (_next, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_consumer_detach_and_reattach_keeps_order() {
        let channel = MemoryChannel::attached();
        let (server, _) = start(&channel).await;
        let config = StreamConfig::new(44100, 1, Some(64), Quality::LowLatency, 1.0).unwrap();
        let input = frames(&config, 12);

        let (stream, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);
        let mut writer = FrameWriter::new(stream, &config);
        for frame in &input[..4] {
            writer.write_frame(frame).await.unwrap();
        }
        assert!(wait_len(&channel, 4 * config.frame_bytes()).await);

        channel.detach();
        for frame in &input[4..] {
            writer.write_frame(frame).await.unwrap();
        }
        assert!(wait_state(&server, ServerState::WaitingForConsumer).await);
        assert_eq!(channel.len(), 4 * config.frame_bytes());

        channel.attach();
        assert!(wait_state(&server, ServerState::Relaying).await);
        drop(writer);

        assert!(wait_state(&server, ServerState::Listening).await);
        let expected: Vec<u8> = input.iter().flat_map(|f| f.as_bytes().to_vec()).collect();
        assert_eq!(channel.contents(), expected);
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sink_write_failure_reported_as_error() {
        let server = StreamingServer::start(server_config(), Box::new(BrokenSink { open_fails: false }))
            .await
            .unwrap();
        let config = StreamConfig::default();

        let (stream, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);
        let mut writer = FrameWriter::new(stream, &config);
        writer.write_frame(&frames(&config, 1)[0]).await.unwrap();

        let reason = wait_error(&server).await.expect("device failure must be published");
        assert!(reason.contains("pipe removed"), "{}", reason);
        assert!(server.session().is_none());

        // Still serving; the error clears with the next session
        let (_next, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);
        assert!(server.status().has_session());
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unopenable_device_rejects_and_reports_error() {
        let server = StreamingServer::start(server_config(), Box::new(BrokenSink { open_fails: true }))
            .await
            .unwrap();

        let (_s, response) = open(server.local_addr(), request(&StreamConfig::default())).await;
        assert_eq!(response, HandshakeResponse::rejected(DEVICE_UNAVAILABLE_REASON));

        let reason = wait_error(&server).await.expect("device failure must be published");
        assert!(reason.starts_with(DEVICE_UNAVAILABLE_REASON), "{}", reason);
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_truncated_stream_returns_to_listening() {
        let channel = MemoryChannel::attached();
        let (server, _) = start(&channel).await;
        let config = StreamConfig::new(44100, 1, Some(64), Quality::LowLatency, 1.0).unwrap();

        let (mut stream, response) = open(server.local_addr(), request(&config)).await;
        assert_eq!(response, HandshakeResponse::Accepted);
        stream.write_all(&[0u8; 10]).await.unwrap();
        drop(stream);

        assert!(wait_state(&server, ServerState::Listening).await);
        assert_eq!(channel.len(), 0);
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_unblocks_session_and_destroys_sink() {
        let channel = MemoryChannel::default();
        let (server, destroyed) = start(&channel).await;
        let config = StreamConfig::default();

        let (stream, _) = open(server.local_addr(), request(&config)).await;
        let mut writer = FrameWriter::new(stream, &config);
        writer.write_frame(&frames(&config, 1)[0]).await.unwrap();
        assert!(wait_state(&server, ServerState::WaitingForConsumer).await);

        let mut status = server.subscribe();
        tokio::time::timeout(WAIT, server.shutdown())
            .await
            .expect("stop must unblock a stalled session")
            .unwrap();

        assert_eq!(*status.borrow_and_update(), ServerState::Stopped);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_client_times_out() {
        let channel = MemoryChannel::attached();
        let sink = MemorySink::new(channel);
        let config = ServerConfig {
            handshake_timeout_ms: 300,
            ..server_config()
        };
        let server = StreamingServer::start(config, Box::new(sink)).await.unwrap();

        let _idle = TcpStream::connect(server.local_addr()).await.unwrap();
        assert!(wait_state(&server, ServerState::Handshaking).await);
        assert!(wait_state(&server, ServerState::Listening).await);
        server.shutdown().await.unwrap();
    }
}
