//! Error taxonomy for the multiplexer.
//!
//! Mux-fatal errors (transport failures, AEAD rejection, protocol violations)
//! become the mux's sticky error and are inherited by every stream. Stream
//! errors (local close, peer close, peer-reported reason) stay local to the
//! stream. `DeadlineExceeded` is operation-local and terminal to nothing.

use std::io;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Underlying transport read/write failure.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// A packet failed AEAD authentication. Fatal to the mux.
    #[error("packet failed authentication")]
    AuthFailure,

    /// A cryptographic operation failed outside of packet authentication
    /// (key agreement, identity proof, cipher instantiation).
    #[error("crypto error: {0}")]
    Crypto(&'static str),

    /// The peer sent something the protocol forbids.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The peer speaks a protocol version older than we support.
    #[error("unsupported peer protocol version {0}")]
    UnsupportedVersion(u8),

    /// Negotiated connection settings fall outside the permitted bounds.
    #[error("unacceptable connection settings: {0}")]
    UnacceptableSettings(&'static str),

    /// The mux was closed locally.
    #[error("connection closed")]
    ClosedConn,

    /// The peer closed the connection.
    #[error("peer closed connection")]
    PeerClosedConn,

    /// The stream was closed locally.
    #[error("stream closed")]
    ClosedStream,

    /// The peer gracefully closed the stream. Surfaces to `read` as EOF.
    #[error("peer closed stream")]
    PeerClosedStream,

    /// The peer closed the stream with an error reason.
    #[error("peer error: {0}")]
    Peer(String),

    /// A read or write deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

impl Error {
    /// Canonicalize an io error: the various OS-level ways a peer can
    /// abandon a connection all collapse to `PeerClosedConn`.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::PeerClosedConn,
            _ => Error::Transport(Arc::new(err)),
        }
    }

    /// Whether this error ends the mux (as opposed to a single stream or a
    /// single operation).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ClosedStream
                | Error::PeerClosedStream
                | Error::Peer(_)
                | Error::DeadlineExceeded
        )
    }
}
