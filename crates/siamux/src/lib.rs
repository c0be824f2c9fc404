//! siamux - encrypted stream multiplexing over a single transport
//!
//! A session multiplexes any number of independent bidirectional byte
//! streams over one connected, reliable, ordered transport (typically TCP).
//! The session is end-to-end encrypted and authenticated against the
//! acceptor's Ed25519 identity, and all traffic travels in fixed-size
//! encrypted packets, so a passive observer learns nothing about stream
//! boundaries, counts, or payload sizes beyond packet granularity.
//!
//! ```no_run
//! use siamux::Mux;
//! use tokio::net::TcpStream;
//!
//! # async fn run(peer_identity: siamux::VerifyingKey) -> siamux::Result<()> {
//! let conn = TcpStream::connect("127.0.0.1:9878").await?;
//! let mux = Mux::dial(conn, peer_identity).await?;
//! let stream = mux.dial_stream();
//! stream.write(b"hello").await?;
//! let mut reply = [0u8; 64];
//! let _n = stream.read(&mut reply).await?;
//! stream.close().await?;
//! mux.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod transport;

mod cipher;
mod frame;
mod handshake;
mod mux;
mod reader;
mod stream;

// Re-export commonly used types
pub use config::Settings;
pub use error::{Error, Result};
pub use mux::Mux;
pub use stream::Stream;
pub use transport::Transport;

// The identity types callers hand to `Mux::dial` / `Mux::accept`.
pub use ed25519_dalek::{SigningKey, VerifyingKey};
