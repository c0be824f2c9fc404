//! The mux runtime: session setup, shared state, and the two IO workers.
//!
//! A `Mux` owns the transport through two spawned tasks. The write worker
//! drains the shared write buffer, padding and sealing it into fixed-size
//! packets; the read worker opens packets, scans frames, and routes each
//! payload to its stream, creating streams the peer announces. All shared
//! state lives under one mutex with two wake groups: `cond` (broadcast:
//! writer, acceptors, close) and `buffer_cond` (single-signal: write-buffer
//! space).

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::{pin, Pin};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use ed25519_dalek::{SigningKey, VerifyingKey};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::cipher::SeqCipher;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::frame::{FrameHeader, FLAG_FIRST, HEADER_SIZE, MIN_STREAM_ID};
use crate::handshake::{self, Handshake};
use crate::reader::PacketReader;
use crate::stream::{close_stream, Stream, StreamState};
use crate::transport::Transport;

/// Stream ids wrap back to the bottom of the user range past this point.
const MAX_STREAM_ID: u32 = 1 << 30;

/// Hard cap on concurrently open streams created by the peer.
const MAX_CONCURRENT_STREAMS: usize = 1 << 20;

/// Write buffer capacity, in multiples of the maximum frame payload.
const WRITE_BUFFER_FRAMES: usize = 10;

/// An encrypted, authenticated session multiplexing streams over one
/// transport.
pub struct Mux {
    shared: Arc<MuxShared>,
    workers: StdMutex<Workers>,
}

struct Workers {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

pub(crate) struct MuxShared {
    pub(crate) settings: Settings,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
    inner: StdMutex<MuxInner>,
    /// General wake group: the write worker, acceptors, and close-drain.
    cond: Notify,
    /// Space-available wake group for `buffer_frame` waiters.
    buffer_cond: Notify,
}

struct MuxInner {
    streams: HashMap<u32, Arc<StreamState>>,
    next_id: u32,
    write_buf: Vec<u8>,
    /// Sticky terminal error; never cleared once set.
    err: Option<Error>,
}

/// Wait for a notification, bounded by an optional absolute deadline. The
/// caller must have `enable`d the future while holding the lock protecting
/// its wait condition, or wakeups may be lost.
pub(crate) async fn wait_or_deadline(
    notified: Pin<&mut Notified<'_>>,
    deadline: Option<Instant>,
) -> Result<()> {
    match deadline {
        Some(deadline) => tokio::select! {
            _ = notified => Ok(()),
            _ = time::sleep_until(deadline) => Err(Error::DeadlineExceeded),
        },
        None => {
            notified.await;
            Ok(())
        }
    }
}

impl MuxShared {
    fn write_buffer_cap(&self) -> usize {
        WRITE_BUFFER_FRAMES * self.settings.max_payload_size()
    }

    /// Append one encoded frame to the shared write buffer, blocking while
    /// the buffer is over capacity.
    pub(crate) async fn buffer_frame(
        &self,
        header: FrameHeader,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let cap = self.write_buffer_cap();
        loop {
            let mut notified = pin!(self.buffer_cond.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(err) = &inner.err {
                    return Err(err.clone());
                }
                if inner.write_buf.len() + HEADER_SIZE + payload.len() <= cap {
                    inner.write_buf.extend_from_slice(&header.encode());
                    inner.write_buf.extend_from_slice(payload);
                    drop(inner);
                    // wake the writer, and pass remaining space to exactly
                    // one other waiter
                    self.cond.notify_waiters();
                    self.buffer_cond.notify_one();
                    return Ok(());
                }
            }
            if let Err(err) = wait_or_deadline(notified, deadline).await {
                // this waiter may have absorbed the single space-available
                // signal; hand it to the next one before giving up
                self.buffer_cond.notify_one();
                return Err(err);
            }
        }
    }

    /// Install the mux's sticky error (first caller wins), propagate it to
    /// every stream, and wake everything. Returns the winning error.
    pub(crate) fn set_err(&self, err: Error) -> Error {
        let (winner, streams) = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.err {
                Some(existing) => (existing.clone(), Vec::new()),
                None => {
                    inner.err = Some(err.clone());
                    (err, inner.streams.values().cloned().collect())
                }
            }
        };
        for stream in streams {
            stream.set_err(winner.clone());
        }
        self.cond.notify_waiters();
        self.buffer_cond.notify_waiters();
        winner
    }

    pub(crate) fn remove_stream(&self, id: u32) {
        self.inner.lock().unwrap().streams.remove(&id);
    }
}

impl Mux {
    /// Establish a session as the dialing peer, expecting the acceptor to
    /// prove possession of `peer_identity`.
    pub async fn dial<T>(conn: T, peer_identity: VerifyingKey) -> Result<Mux>
    where
        T: Transport + 'static,
    {
        Self::dial_with_settings(conn, peer_identity, Settings::default()).await
    }

    /// As [`Mux::dial`], proposing explicit connection settings.
    pub async fn dial_with_settings<T>(
        mut conn: T,
        peer_identity: VerifyingKey,
        settings: Settings,
    ) -> Result<Mux>
    where
        T: Transport + 'static,
    {
        let hs = handshake::dial(&mut conn, &peer_identity, settings).await?;
        Ok(Self::start(conn, hs, true))
    }

    /// Dial without a pre-shared acceptor identity, using the well-known
    /// all-zero-seed keypair. Encryption only, no authentication.
    pub async fn dial_anonymous<T>(conn: T) -> Result<Mux>
    where
        T: Transport + 'static,
    {
        let identity = handshake::anonymous_identity().verifying_key();
        Self::dial_with_settings(conn, identity, Settings::default()).await
    }

    /// Establish a session as the accepting peer, proving possession of
    /// `identity`.
    pub async fn accept<T>(conn: T, identity: SigningKey) -> Result<Mux>
    where
        T: Transport + 'static,
    {
        Self::accept_with_settings(conn, identity, Settings::default()).await
    }

    /// As [`Mux::accept`], proposing explicit connection settings.
    pub async fn accept_with_settings<T>(
        mut conn: T,
        identity: SigningKey,
        settings: Settings,
    ) -> Result<Mux>
    where
        T: Transport + 'static,
    {
        let hs = handshake::accept(&mut conn, &identity, settings).await?;
        Ok(Self::start(conn, hs, false))
    }

    /// Accept with the well-known anonymous identity.
    pub async fn accept_anonymous<T>(conn: T) -> Result<Mux>
    where
        T: Transport + 'static,
    {
        Self::accept_with_settings(conn, handshake::anonymous_identity(), Settings::default()).await
    }

    fn start<T>(conn: T, hs: Handshake, dialer: bool) -> Mux
    where
        T: Transport + 'static,
    {
        let local_addr = conn.local_addr();
        let peer_addr = conn.peer_addr();
        let shared = Arc::new(MuxShared {
            settings: hs.settings,
            local_addr,
            peer_addr,
            inner: StdMutex::new(MuxInner {
                streams: HashMap::new(),
                // dialed streams use even ids, accepted streams odd ones
                next_id: if dialer {
                    MIN_STREAM_ID
                } else {
                    MIN_STREAM_ID | 1
                },
                write_buf: Vec::new(),
                err: None,
            }),
            cond: Notify::new(),
            buffer_cond: Notify::new(),
        });
        let (read_half, write_half) = tokio::io::split(conn);
        let packet_reader = PacketReader::new(
            read_half,
            hs.open,
            hs.settings.packet_size as usize,
            hs.settings.max_payload_size(),
        );
        let reader = tokio::spawn(read_loop(shared.clone(), packet_reader));
        let writer = tokio::spawn(write_loop(shared.clone(), write_half, hs.seal));
        Mux {
            shared,
            workers: StdMutex::new(Workers {
                reader: Some(reader),
                writer: Some(writer),
            }),
        }
    }

    /// The settings negotiated for this session.
    pub fn settings(&self) -> Settings {
        self.shared.settings
    }

    /// Number of streams currently tracked by this side.
    pub fn stream_count(&self) -> usize {
        self.shared.inner.lock().unwrap().streams.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Open a new stream. Performs no IO: the peer learns of the stream
    /// from its first written frame.
    pub fn dial_stream(&self) -> Stream {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.next_id > MAX_STREAM_ID {
            inner.next_id = MIN_STREAM_ID | (inner.next_id & 1);
        }
        let id = inner.next_id;
        inner.next_id += 2;
        let state = StreamState::new(id, true, inner.err.clone());
        inner.streams.insert(id, state.clone());
        drop(inner);
        Stream::new(state, self.shared.clone())
    }

    /// Open a new stream whose lifetime is scoped to `cancel`: when the
    /// future resolves, the stream is closed as if by [`Stream::close`].
    pub fn dial_stream_with_cancel<F>(&self, cancel: F) -> Stream
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stream = self.dial_stream();
        let state = Arc::downgrade(stream.state());
        let shared: Weak<MuxShared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            cancel.await;
            if let (Some(state), Some(shared)) = (state.upgrade(), shared.upgrade()) {
                let _ = close_stream(&state, &shared, None).await;
            }
        });
        stream
    }

    /// Wait for the peer to open a stream. Acceptance order is
    /// unspecified; callers must not rely on FIFO behaviour.
    pub async fn accept_stream(&self) -> Result<Stream> {
        loop {
            let mut notified = pin!(self.shared.cond.notified());
            notified.as_mut().enable();
            {
                let inner = self.shared.inner.lock().unwrap();
                if let Some(err) = &inner.err {
                    return Err(err.clone());
                }
                let pending = inner
                    .streams
                    .values()
                    .find(|s| s.need_accept.swap(false, Ordering::AcqRel))
                    .cloned();
                if let Some(state) = pending {
                    drop(inner);
                    return Ok(Stream::new(state, self.shared.clone()));
                }
            }
            notified.await;
        }
    }

    /// Close the session: drain buffered frames, tear down both workers,
    /// and shut the transport down. Idempotent; returns `Ok` if the
    /// session ended by a local or peer close, otherwise the error that
    /// killed it.
    pub async fn close(&self) -> Result<()> {
        // let the writer flush whatever is buffered
        loop {
            let mut notified = pin!(self.shared.cond.notified());
            notified.as_mut().enable();
            {
                let inner = self.shared.inner.lock().unwrap();
                if inner.err.is_some() || inner.write_buf.is_empty() {
                    break;
                }
            }
            notified.await;
        }
        let terminal = self.shared.set_err(Error::ClosedConn);
        let (reader, writer) = {
            let mut workers = self.workers.lock().unwrap();
            (workers.reader.take(), workers.writer.take())
        };
        if let Some(writer) = writer {
            // the writer observes the error, shuts down the write side, and
            // exits
            let _ = writer.await;
        }
        if let Some(reader) = reader {
            reader.abort();
        }
        match terminal {
            Error::ClosedConn | Error::PeerClosedConn => Ok(()),
            err => Err(err),
        }
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shared.set_err(Error::ClosedConn);
        let mut workers = self.workers.lock().unwrap();
        if let Some(reader) = workers.reader.take() {
            reader.abort();
        }
        if let Some(writer) = workers.writer.take() {
            writer.abort();
        }
    }
}

/// The write worker: waits for buffered frames (or a keepalive falling
/// due), packs them into padded packets, seals each in place, and writes
/// the batch to the transport.
async fn write_loop<W>(shared: Arc<MuxShared>, mut conn: W, mut seal: SeqCipher)
where
    W: AsyncWrite + Unpin,
{
    let packet_size = shared.settings.packet_size as usize;
    let max_frame = shared.settings.max_frame_size();
    let keepalive = shared.settings.keepalive_interval();
    let mut scratch: Vec<u8> = Vec::new();
    let mut next_keepalive = Instant::now() + keepalive;

    let exit_err: Option<Error> = 'outer: loop {
        // wait until there is work, the mux died, or a keepalive is due
        loop {
            let mut notified = pin!(shared.cond.notified());
            notified.as_mut().enable();
            let ready = {
                let inner = shared.inner.lock().unwrap();
                inner.err.is_some() || !inner.write_buf.is_empty()
            };
            if ready || Instant::now() >= next_keepalive {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = time::sleep_until(next_keepalive) => {}
            }
        }

        // pack and seal under the lock; IO happens after release
        {
            let mut inner = shared.inner.lock().unwrap();
            if inner.err.is_some() {
                break 'outer None;
            }
            if inner.write_buf.is_empty() {
                if Instant::now() < next_keepalive {
                    // spurious wake (e.g. a new acceptable stream)
                    continue 'outer;
                }
                let keepalive_frame = FrameHeader::KEEPALIVE.encode();
                inner.write_buf.extend_from_slice(&keepalive_frame);
            }
            // split the buffer into packet-size chunks; the zero-filled
            // scratch supplies the padding of the final packet
            let len = inner.write_buf.len();
            let packets = len.div_ceil(max_frame);
            scratch.clear();
            scratch.resize(packets * packet_size, 0);
            let mut seal_err = None;
            for i in 0..packets {
                let chunk = &inner.write_buf[i * max_frame..len.min((i + 1) * max_frame)];
                let dst = &mut scratch[i * packet_size..(i + 1) * packet_size];
                dst[..chunk.len()].copy_from_slice(chunk);
                if let Err(err) = seal.seal_in_place(dst) {
                    seal_err = Some(err);
                    break;
                }
            }
            inner.write_buf.clear();
            drop(inner);
            shared.buffer_cond.notify_one();
            shared.cond.notify_waiters();
            if let Some(err) = seal_err {
                break 'outer Some(err);
            }
        }

        next_keepalive = Instant::now() + keepalive;
        if let Err(err) = conn.write_all(&scratch).await {
            break 'outer Some(Error::from_io(err));
        }
        if let Err(err) = conn.flush().await {
            break 'outer Some(Error::from_io(err));
        }
    };

    if let Some(err) = exit_err {
        tracing::debug!(%err, "write worker failed");
        shared.set_err(err);
    }
    let _ = conn.shutdown().await;
    tracing::trace!("write worker stopped");
}

/// The read worker: opens packets, scans frames, and routes payloads. The
/// most recently used stream is cached to skip the table lookup on runs of
/// frames to one stream; the cache is invalidated whenever a stream is
/// removed.
async fn read_loop<R>(shared: Arc<MuxShared>, mut packet_reader: PacketReader<R>)
where
    R: AsyncRead + Unpin,
{
    let mut scratch: Vec<u8> = Vec::new();
    let mut cached: Option<Arc<StreamState>> = None;

    let exit_err: Option<Error> = loop {
        if shared.inner.lock().unwrap().err.is_some() {
            break None;
        }
        let (h, payload) = match packet_reader.next_frame(&mut scratch).await {
            Ok(frame) => frame,
            Err(err) => break Some(err),
        };
        if h.is_keepalive() {
            continue;
        }
        if h.id < MIN_STREAM_ID {
            break Some(Error::Protocol("frame on a reserved stream id"));
        }

        let stream = match &cached {
            Some(s) if s.id == h.id => s.clone(),
            _ => {
                let mut inner = shared.inner.lock().unwrap();
                if inner.err.is_some() {
                    break None;
                }
                match inner.streams.get(&h.id).cloned() {
                    Some(state) => state,
                    None if h.flags & FLAG_FIRST == 0 => {
                        // stream already torn down on this side; in-flight
                        // peer frames are benign
                        continue;
                    }
                    None => {
                        if inner.streams.len() >= MAX_CONCURRENT_STREAMS {
                            break Some(Error::Protocol("too many concurrent streams"));
                        }
                        let state = StreamState::new(h.id, false, None);
                        inner.streams.insert(h.id, state.clone());
                        drop(inner);
                        tracing::trace!(id = h.id, "peer opened stream");
                        shared.cond.notify_waiters();
                        state
                    }
                }
            }
        };
        cached = Some(stream.clone());
        if stream.consume_frame(h, payload).await {
            shared.remove_stream(h.id);
            cached = None;
        }
    };

    if let Some(err) = exit_err {
        tracing::debug!(%err, "read worker failed");
        shared.set_err(err);
    }
    tracing::trace!("read worker stopped");
}
