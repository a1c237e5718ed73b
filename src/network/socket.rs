//! TCP socket setup
//!
//! Both ends disable Nagle and keep kernel buffers small so queued audio
//! does not turn into latency.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};

use crate::constants::SOCKET_BUFFER_SIZE;
use crate::error::TransportError;

const LISTEN_BACKLOG: i32 = 16;

/// Bind a listening socket with address reuse and a small receive buffer
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket
        .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

/// Resolve `host:port`, taking the first address
pub async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    lookup_host(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| TransportError::ConnectionFailed(format!("no address for {}", addr)))
}

/// Connect with a deadline and apply the streaming socket options
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let target = resolve(addr).await?;
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(TransportError::ConnectionFailed(format!("{}: {}", target, e)))
        }
        Err(_) => return Err(TransportError::Timeout),
    };
    tune_stream(&stream, false)?;
    Ok(stream)
}

/// Disable Nagle and shrink the relevant kernel buffer
pub fn tune_stream(stream: &TcpStream, receiving: bool) -> Result<(), TransportError> {
    let opt_err = |e: std::io::Error| TransportError::ConnectionFailed(format!("socket option: {}", e));

    stream.set_nodelay(true).map_err(opt_err)?;
    let sock = SockRef::from(stream);
    if receiving {
        sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE).map_err(opt_err)?;
    } else {
        sock.set_send_buffer_size(SOCKET_BUFFER_SIZE).map_err(opt_err)?;
    }
    Ok(())
}
