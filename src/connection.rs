//! Connection handles.
//!
//! A handle is owned by exactly one component at a time: the accept loop,
//! the waiting queue, or the session running on a pool slot. Dropping the
//! handle closes the underlying socket, so closing happens exactly once.

use std::net::SocketAddr;
use tokio::net::TcpStream;

/// An inbound connection as seen by the admission machinery.
pub trait ConnectionHandle: Send + 'static {
    /// Remote identity, used for logging.
    fn peer(&self) -> SocketAddr;
}

/// An accepted TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    /// Give up the handle and take the stream.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl ConnectionHandle for TcpConnection {
    fn peer(&self) -> SocketAddr {
        self.peer
    }
}
