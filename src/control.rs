//! Control surface shared by the client and server
//!
//! Each side publishes its state on a `watch` channel so front-ends can
//! poll `status()` or await transitions. A single [`Shutdown`] signal is
//! observed by async tasks and blocking threads alike.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Streaming client state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ClientState {
    Idle,
    Connecting,
    Handshaking,
    Streaming,
    Disconnected,
    Error(String),
    Stopped,
}

impl ClientState {
    /// No further transitions will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Stopped | ClientState::Error(_))
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Idle => f.write_str("idle"),
            ClientState::Connecting => f.write_str("connecting"),
            ClientState::Handshaking => f.write_str("handshaking"),
            ClientState::Streaming => f.write_str("streaming"),
            ClientState::Disconnected => f.write_str("disconnected"),
            ClientState::Error(reason) => write!(f, "error: {}", reason),
            ClientState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Streaming server state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ServerState {
    Listening,
    Handshaking,
    /// Frames are reaching the virtual device
    Relaying,
    /// A session is up but no application is reading the device
    WaitingForConsumer,
    Error(String),
    Stopped,
}

impl ServerState {
    /// A session is currently bound
    pub fn has_session(&self) -> bool {
        matches!(
            self,
            ServerState::Handshaking | ServerState::Relaying | ServerState::WaitingForConsumer
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Listening => f.write_str("listening"),
            ServerState::Handshaking => f.write_str("handshaking"),
            ServerState::Relaying => f.write_str("relaying"),
            ServerState::WaitingForConsumer => f.write_str("waiting for application"),
            ServerState::Error(reason) => write!(f, "error: {}", reason),
            ServerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Publisher side of a state channel, cheap to share between tasks
#[derive(Clone)]
pub struct StatePublisher<S> {
    tx: Arc<watch::Sender<S>>,
}

impl<S: Clone + PartialEq + fmt::Display> StatePublisher<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new state, logging the transition. Repeats are ignored.
    pub fn set(&self, state: S) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::info!("State: {} -> {}", current, state);
            *current = state;
            true
        });
    }

    pub fn get(&self) -> S {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }
}

/// Wait until `pred` holds for the published state, or the timeout elapses.
///
/// Returns the matching state.
pub async fn wait_for<S, F>(
    rx: &mut watch::Receiver<S>,
    timeout: Duration,
    mut pred: F,
) -> Option<S>
where
    S: Clone,
    F: FnMut(&S) -> bool,
{
    let fut = async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&state) {
                    return Some(state.clone());
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    };
    tokio::time::timeout(timeout, fut).await.ok().flatten()
}

/// Trigger side of the shutdown signal
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Observer side of the shutdown signal
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a linked trigger/observer pair
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
    }

    /// Non-blocking check, usable from plain threads
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires (or the trigger is dropped)
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
