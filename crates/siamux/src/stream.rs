//! A single multiplexed byte stream.
//!
//! Streams carry an inbound buffer filled by the mux's read worker and drain
//! their outbound bytes into the mux-global write buffer. All stream state
//! sits behind the stream's own mutex; the mux mutex is never held at the
//! same time.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::frame::{FrameHeader, FLAG_ERROR, FLAG_FIRST, FLAG_LAST};
use crate::mux::{wait_or_deadline, MuxShared};

/// Handle to one bidirectional stream of a mux session.
///
/// Dialed streams cost nothing until the first `write`; the peer learns of
/// the stream from the first frame it carries.
pub struct Stream {
    state: Arc<StreamState>,
    shared: Arc<MuxShared>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.state.id).finish()
    }
}

pub(crate) struct StreamState {
    pub(crate) id: u32,
    /// Whether this side created the stream (via `dial_stream`).
    local: bool,
    /// Set on peer-created streams until `accept_stream` claims them.
    pub(crate) need_accept: AtomicBool,
    cond: Notify,
    inner: StdMutex<StreamInner>,
}

struct StreamInner {
    /// Whether the peer knows about this stream.
    established: bool,
    read_buf: Vec<u8>,
    read_off: usize,
    /// Sticky terminal error; never cleared once set.
    err: Option<Error>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl StreamState {
    pub(crate) fn new(id: u32, local: bool, err: Option<Error>) -> Arc<StreamState> {
        Arc::new(StreamState {
            id,
            local,
            need_accept: AtomicBool::new(!local),
            cond: Notify::new(),
            inner: StdMutex::new(StreamInner {
                established: !local,
                read_buf: Vec::new(),
                read_off: 0,
                err,
                read_deadline: None,
                write_deadline: None,
            }),
        })
    }

    /// Set the stream's terminal error if it has none yet, and wake every
    /// blocked operation.
    pub(crate) fn set_err(&self, err: Error) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.err.is_none() {
                inner.err = Some(err);
            }
        }
        self.cond.notify_waiters();
    }

    /// Route one inbound frame to this stream. Returns true when the frame
    /// closed the stream and its table entry should be removed.
    ///
    /// For data frames this blocks until `read` has drained the payload (or
    /// the stream reached a terminal state, or its read deadline passed);
    /// the read worker must not advance past a frame whose bytes are still
    /// pending.
    pub(crate) async fn consume_frame(&self, h: FrameHeader, payload: &[u8]) -> bool {
        if h.flags & FLAG_LAST != 0 {
            let err = if h.flags & FLAG_ERROR != 0 {
                Error::Peer(String::from_utf8_lossy(payload).into_owned())
            } else {
                Error::PeerClosedStream
            };
            self.set_err(err);
            return true;
        }

        let deadline;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.err.is_some() {
                // torn down locally; late payloads are dropped
                return false;
            }
            inner.read_buf.clear();
            inner.read_buf.extend_from_slice(payload);
            inner.read_off = 0;
            deadline = inner.read_deadline;
        }
        self.cond.notify_waiters();

        loop {
            let mut notified = pin!(self.cond.notified());
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().unwrap();
                if inner.read_off >= inner.read_buf.len() || inner.err.is_some() {
                    return false;
                }
            }
            if wait_or_deadline(notified, deadline).await.is_err() {
                // the stream's read deadline passed with bytes still
                // unclaimed; drop them rather than stall the read worker
                return false;
            }
        }
    }
}

impl Stream {
    pub(crate) fn new(state: Arc<StreamState>, shared: Arc<MuxShared>) -> Stream {
        Stream { state, shared }
    }

    pub(crate) fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    /// The stream's id within the session.
    pub fn id(&self) -> u32 {
        self.state.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Read bytes from the stream, waiting for data, a terminal state, or
    /// the read deadline. Returns `Ok(0)` once the peer has gracefully
    /// closed the stream and all its bytes have been drained.
    ///
    /// # Panics
    ///
    /// Panics when called on a dialed stream before its first `write`: the
    /// peer does not know the stream exists, so no data can ever arrive.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (deadline, unannounced) = {
            let inner = self.state.inner.lock().unwrap();
            let unannounced = self.state.local && !inner.established && inner.err.is_none();
            (inner.read_deadline, unannounced)
        };
        if unannounced {
            panic!("cannot read from a dialed stream before writing to it");
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut notified = pin!(self.state.cond.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.state.inner.lock().unwrap();
                let avail = inner.read_buf.len() - inner.read_off;
                if avail > 0 {
                    let n = avail.min(buf.len());
                    let start = inner.read_off;
                    buf[..n].copy_from_slice(&inner.read_buf[start..start + n]);
                    inner.read_off += n;
                    let drained = inner.read_off >= inner.read_buf.len();
                    drop(inner);
                    if drained {
                        // hand the buffer back to the read worker
                        self.state.cond.notify_waiters();
                    }
                    return Ok(n);
                }
                match &inner.err {
                    Some(Error::PeerClosedStream) => return Ok(0),
                    Some(err) => return Err(err.clone()),
                    None => {}
                }
            }
            wait_or_deadline(notified, deadline).await?;
        }
    }

    /// Write all of `buf` to the stream, chunking it into frames. Blocks
    /// while the mux-global write buffer is full; fails with
    /// `DeadlineExceeded` once the write deadline passes.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        let deadline = {
            let inner = self.state.inner.lock().unwrap();
            inner.write_deadline
        };
        let max_payload = self.shared.settings.max_payload_size();
        let mut rest = buf;
        while !rest.is_empty() {
            // claim the First flag under the stream lock
            let first = {
                let mut inner = self.state.inner.lock().unwrap();
                if let Some(err) = &inner.err {
                    return Err(err.clone());
                }
                !std::mem::replace(&mut inner.established, true)
            };
            let n = rest.len().min(max_payload);
            let header = FrameHeader {
                id: self.state.id,
                length: n as u16,
                flags: if first { FLAG_FIRST } else { 0 },
            };
            if let Err(err) = self.shared.buffer_frame(header, &rest[..n], deadline).await {
                if first {
                    // the frame never entered the write buffer, so the peer
                    // has not seen the stream; a retry must re-announce it
                    self.state.inner.lock().unwrap().established = false;
                }
                return Err(err);
            }
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Gracefully close the stream, notifying the peer. Closing an already
    /// terminal stream is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.shutdown(None).await
    }

    /// Close the stream with an error reason the peer will observe as its
    /// terminal stream error.
    pub async fn close_with_error(&self, reason: &str) -> Result<()> {
        self.shutdown(Some(reason)).await
    }

    async fn shutdown(&self, reason: Option<&str>) -> Result<()> {
        close_stream(&self.state, &self.shared, reason).await
    }

    /// Set both the read and write deadlines. Deadlines apply to operations
    /// started after the call; a blocked `read` or `write` keeps the
    /// deadline it began with.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.read_deadline = deadline;
        inner.write_deadline = deadline;
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.state.inner.lock().unwrap().read_deadline = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.state.inner.lock().unwrap().write_deadline = deadline;
    }
}

/// Shared close path for `Stream::close` and cancellation helpers: mark the
/// stream terminal, drop it from the stream table, then tell the peer.
pub(crate) async fn close_stream(
    state: &Arc<StreamState>,
    shared: &MuxShared,
    reason: Option<&str>,
) -> Result<()> {
    {
        let mut inner = state.inner.lock().unwrap();
        if inner.err.is_some() {
            return Ok(());
        }
        inner.err = Some(Error::ClosedStream);
    }
    state.cond.notify_waiters();
    shared.remove_stream(state.id);

    let (payload, flags) = match reason {
        Some(reason) => {
            let bytes = reason.as_bytes();
            let n = bytes.len().min(shared.settings.max_payload_size());
            (&bytes[..n], FLAG_LAST | FLAG_ERROR)
        }
        None => (&[][..], FLAG_LAST),
    };
    let header = FrameHeader {
        id: state.id,
        length: payload.len() as u16,
        flags,
    };
    shared.buffer_frame(header, payload, None).await
}
