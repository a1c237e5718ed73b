//! Network subsystem: TCP transport between client and server

pub mod client;
pub mod framing;
pub mod server;
pub mod socket;

pub use client::{ClientHandle, ClientStats, StreamingClient};
pub use framing::{FrameReader, FrameWriter};
pub use server::{ServerHandle, SessionInfo, StreamingServer};
