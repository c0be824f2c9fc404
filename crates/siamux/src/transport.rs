//! Transport abstraction.
//!
//! A session runs over any connected, reliable, ordered duplex byte channel.
//! The trait adds optional socket-address introspection on top of the async
//! IO bounds so streams can report where their bytes go.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

/// A connected duplex byte channel the mux can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Local socket address, when the transport has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote socket address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for tokio::net::TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self).ok()
    }
}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {}

/// In-memory pipe, used heavily by the test suite.
impl Transport for tokio::io::DuplexStream {}
