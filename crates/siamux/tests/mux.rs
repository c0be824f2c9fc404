//! End-to-end session tests over in-memory duplex transports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use siamux::{Error, Mux, Settings, SigningKey, Stream};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{sleep, timeout, Instant};

fn identity() -> SigningKey {
    SigningKey::from_bytes(&[0x5a; 32])
}

async fn mux_pair_with(buffer: usize, dialer: Settings, acceptor: Settings) -> (Mux, Mux) {
    let (a, b) = duplex(buffer);
    let id = identity();
    let peer = id.verifying_key();
    let server = tokio::spawn(async move { Mux::accept_with_settings(b, id, acceptor).await });
    let client = Mux::dial_with_settings(a, peer, dialer).await.unwrap();
    (client, server.await.unwrap().unwrap())
}

async fn mux_pair() -> (Mux, Mux) {
    mux_pair_with(1 << 20, Settings::default(), Settings::default()).await
}

/// `Stream::read` returns partial reads; tests usually want exact counts.
async fn read_full(stream: &Stream, buf: &mut [u8]) -> siamux::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(Error::PeerClosedStream);
        }
        filled += n;
    }
    Ok(())
}

/// Stream-table removal on the receiving side happens on the read worker;
/// give it a moment before asserting.
async fn wait_stream_count(mux: &Mux, want: usize) {
    for _ in 0..200 {
        if mux.stream_count() == want {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(mux.stream_count(), want);
}

#[tokio::test]
async fn echo() -> Result<()> {
    let (client, server) = mux_pair().await;
    let server_task = tokio::spawn(async move {
        let stream = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 5];
        read_full(&stream, &mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        stream.write(b"hello, world!").await.unwrap();
        stream.close().await.unwrap();
        server
    });

    let stream = client.dial_stream();
    stream.write(b"world").await?;
    let mut reply = [0u8; 13];
    read_full(&stream, &mut reply).await?;
    assert_eq!(&reply, b"hello, world!");
    assert_eq!(stream.read(&mut [0u8; 1]).await?, 0);
    stream.close().await?;

    let server = server_task.await.unwrap();
    wait_stream_count(&client, 0).await;
    wait_stream_count(&server, 0).await;
    client.close().await?;
    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn many_streams() -> Result<()> {
    let (client, server) = mux_pair().await;
    let server = Arc::new(server);
    let server_task = tokio::spawn({
        let server = server.clone();
        async move {
            let mut tasks = Vec::new();
            for _ in 0..100 {
                let stream = server.accept_stream().await.unwrap();
                tasks.push(tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = stream.read(&mut buf).await.unwrap();
                    stream.write(&buf[..n]).await.unwrap();
                    stream.close().await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        }
    });

    let mut tasks = Vec::new();
    for i in 0..100 {
        let stream = client.dial_stream();
        tasks.push(tokio::spawn(async move {
            let msg = format!("hello, {i}!");
            stream.write(msg.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            read_full(&stream, &mut buf).await.unwrap();
            assert_eq!(buf, msg.as_bytes());
            assert_eq!(stream.read(&mut [0u8; 1]).await.unwrap(), 0);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    server_task.await.unwrap();

    wait_stream_count(&client, 0).await;
    wait_stream_count(&server, 0).await;
    client.close().await?;
    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn byte_order_preserved_across_boundaries() -> Result<()> {
    let (client, server) = mux_pair().await;
    let data: Vec<u8> = (0..100_000usize).map(|i| (i % 251) as u8).collect();

    let server_task = tokio::spawn(async move {
        let stream = server.accept_stream().await.unwrap();
        let mut echoed = 0usize;
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            stream.write(&buf[..n]).await.unwrap();
            echoed += n;
        }
        (server, echoed)
    });

    let stream = Arc::new(client.dial_stream());
    let writer = tokio::spawn({
        let stream = stream.clone();
        let data = data.clone();
        async move {
            stream.write(&data).await.unwrap();
        }
    });

    let mut received = Vec::with_capacity(data.len());
    let mut buf = vec![0u8; 4096];
    while received.len() < data.len() {
        let n = stream.read(&mut buf).await?;
        assert_ne!(n, 0, "premature EOF");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, data);

    writer.await.unwrap();
    stream.close().await?;
    let (server, echoed) = server_task.await.unwrap();
    assert_eq!(echoed, data.len());
    client.close().await?;
    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn settings_negotiated_to_minimum() {
    let a = Settings {
        packet_size: 2048,
        max_timeout_ms: 600_000,
    };
    let b = Settings {
        packet_size: 1300,
        max_timeout_ms: 900_000,
    };
    let (client, server) = mux_pair_with(1 << 20, a, b).await;
    let expect = Settings {
        packet_size: 1300,
        max_timeout_ms: 600_000,
    };
    assert_eq!(client.settings(), expect);
    assert_eq!(server.settings(), expect);
}

#[tokio::test]
async fn stream_ids_have_role_parity() -> Result<()> {
    let (client, server) = mux_pair().await;
    let c1 = client.dial_stream();
    let c2 = client.dial_stream();
    assert_eq!((c1.id(), c2.id()), (256, 258));

    let s1 = server.dial_stream();
    assert_eq!(s1.id(), 257);
    s1.write(b"from server").await?;
    let accepted = client.accept_stream().await?;
    assert_eq!(accepted.id(), 257);
    Ok(())
}

#[tokio::test]
async fn write_deadline_expires() -> Result<()> {
    // small pipe, and a peer that never reads: backpressure all the way up
    let (client, server) = mux_pair_with(1024, Settings::default(), Settings::default()).await;
    let stream = client.dial_stream();
    stream.set_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let payload = vec![0u8; 40 * 1024];
    let err = stream.write(&payload).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
    drop(server);
    Ok(())
}

#[tokio::test]
async fn read_deadline_expires() {
    let (client, _server) = mux_pair().await;
    let stream = client.dial_stream();
    stream.write(b"x").await.unwrap();
    stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
    let err = stream.read(&mut [0u8; 8]).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
}

#[tokio::test]
async fn past_read_deadline_does_not_poison_write() -> Result<()> {
    let (client, server) = mux_pair().await;
    let server_task = tokio::spawn(async move {
        let stream = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        read_full(&stream, &mut buf).await.unwrap();
        stream.write(b"pong").await.unwrap();
        server
    });

    let stream = client.dial_stream();
    stream.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)));
    sleep(Duration::from_millis(2)).await;
    stream.write(b"ping").await?;

    stream.set_read_deadline(None);
    let mut buf = [0u8; 4];
    read_full(&stream, &mut buf).await?;
    assert_eq!(&buf, b"pong");
    server_task.await.unwrap();
    Ok(())
}

#[tokio::test]
async fn new_deadline_does_not_interrupt_pending_read() -> Result<()> {
    let (client, server) = mux_pair().await;
    let stream = Arc::new(client.dial_stream());
    stream.write(b"ping").await?;

    let pending = tokio::spawn({
        let stream = stream.clone();
        async move {
            let mut buf = [0u8; 4];
            read_full(&stream, &mut buf).await.unwrap();
            buf
        }
    });
    sleep(Duration::from_millis(50)).await;
    // a deadline in the past applies only to future reads
    stream.set_read_deadline(Some(Instant::now() - Duration::from_millis(10)));
    sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    let remote = server.accept_stream().await?;
    let mut buf = [0u8; 4];
    read_full(&remote, &mut buf).await?;
    remote.write(b"pong").await?;
    assert_eq!(&pending.await.unwrap(), b"pong");
    Ok(())
}

#[tokio::test]
async fn peer_close_surfaces_as_eof_after_drain() -> Result<()> {
    let (client, server) = mux_pair().await;
    let stream = client.dial_stream();
    stream.write(b"ping").await?;

    let remote = server.accept_stream().await?;
    let mut buf = [0u8; 4];
    read_full(&remote, &mut buf).await?;
    remote.write(b"bye").await?;
    remote.close().await?;

    // one byte at a time across the close boundary
    let mut got = Vec::new();
    loop {
        let mut b = [0u8; 1];
        let n = stream.read(&mut b).await?;
        if n == 0 {
            break;
        }
        got.push(b[0]);
    }
    assert_eq!(got, b"bye");
    Ok(())
}

#[tokio::test]
async fn close_with_reason_is_surfaced() -> Result<()> {
    let (client, server) = mux_pair().await;
    let stream = client.dial_stream();
    stream.write(b"hi").await?;

    let remote = server.accept_stream().await?;
    let mut buf = [0u8; 2];
    read_full(&remote, &mut buf).await?;
    remote.close_with_error("task failed successfully").await?;

    let err = stream.read(&mut [0u8; 8]).await.unwrap_err();
    match err {
        Error::Peer(reason) => assert_eq!(reason, "task failed successfully"),
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn cancelled_stream_becomes_closed() -> Result<()> {
    let (client, _server) = mux_pair().await;
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let stream = client.dial_stream_with_cancel(async move {
        let _ = rx.await;
    });
    stream.write(b"hi").await?;
    tx.send(()).expect("cancel helper alive");

    let mut closed = false;
    for _ in 0..100 {
        match stream.write(b"more").await {
            Err(Error::ClosedStream) => {
                closed = true;
                break;
            }
            Ok(()) => sleep(Duration::from_millis(5)).await,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(closed);
    Ok(())
}

#[tokio::test]
async fn anonymous_session() -> Result<()> {
    let (a, b) = duplex(1 << 16);
    let server = tokio::spawn(async move { Mux::accept_anonymous(b).await.unwrap() });
    let client = Mux::dial_anonymous(a).await?;
    let server = server.await.unwrap();

    let stream = client.dial_stream();
    stream.write(b"psst").await?;
    let remote = server.accept_stream().await?;
    let mut buf = [0u8; 4];
    read_full(&remote, &mut buf).await?;
    assert_eq!(&buf, b"psst");
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent_and_graceful() -> Result<()> {
    let (client, server) = mux_pair().await;
    client.close().await?;
    client.close().await?;

    // new streams on a closed mux fail immediately
    let stream = client.dial_stream();
    assert!(matches!(stream.write(b"x").await, Err(Error::ClosedConn)));

    // the peer observes a graceful disconnect
    let err = timeout(Duration::from_secs(5), server.accept_stream())
        .await?
        .unwrap_err();
    assert!(matches!(err, Error::PeerClosedConn));
    server.close().await?;
    Ok(())
}

#[tokio::test]
#[should_panic(expected = "before writing")]
async fn read_before_write_panics() {
    let (client, _server) = mux_pair().await;
    let stream = client.dial_stream();
    let _ = stream.read(&mut [0u8; 1]).await;
}

/// Wire up two duplex pairs through a relay that counts client->server
/// bytes and optionally flips one of them.
async fn relay(flip_at: Option<u64>) -> (DuplexStream, DuplexStream, Arc<AtomicU64>) {
    let (c_local, c_remote) = duplex(1 << 16);
    let (s_local, s_remote) = duplex(1 << 16);
    let counter = Arc::new(AtomicU64::new(0));
    let (mut cr, mut cw) = tokio::io::split(c_remote);
    let (mut sr, mut sw) = tokio::io::split(s_remote);

    tokio::spawn({
        let counter = counter.clone();
        async move {
            let mut buf = [0u8; 4096];
            loop {
                let n = match cr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let start = counter.fetch_add(n as u64, Ordering::SeqCst);
                if let Some(at) = flip_at {
                    if at >= start && at < start + n as u64 {
                        buf[(at - start) as usize] ^= 0x01;
                    }
                }
                if sw.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = sw.shutdown().await;
        }
    });
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = match sr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if cw.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = cw.shutdown().await;
    });
    (c_local, s_local, counter)
}

/// Bytes the dialer sends before packet traffic starts: version byte,
/// ephemeral pubkey, sealed settings.
const DIALER_HANDSHAKE_LEN: u64 = 1 + 32 + 24;

#[tokio::test]
async fn tampered_packet_is_fatal() {
    let (c, s, _counter) = relay(Some(DIALER_HANDSHAKE_LEN + 10)).await;
    let id = identity();
    let peer = id.verifying_key();
    let server = tokio::spawn(async move { Mux::accept(s, id).await.unwrap() });
    let client = Mux::dial(c, peer).await.unwrap();
    let server = server.await.unwrap();

    let stream = client.dial_stream();
    stream.write(b"hello there").await.unwrap();

    let err = timeout(Duration::from_secs(5), server.accept_stream())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::AuthFailure));
    // sticky: the mux stays dead
    let err = server.accept_stream().await.unwrap_err();
    assert!(matches!(err, Error::AuthFailure));
}

#[tokio::test]
async fn wire_traffic_is_whole_packets() -> Result<()> {
    let (c, s, counter) = relay(None).await;
    let id = identity();
    let peer = id.verifying_key();
    let server = tokio::spawn(async move { Mux::accept(s, id).await.unwrap() });
    let client = Mux::dial(c, peer).await.unwrap();
    let server = server.await.unwrap();

    let stream = client.dial_stream();
    stream.write(b"some payload").await?;
    stream.close().await?;
    client.close().await?;

    sleep(Duration::from_millis(100)).await;
    let total = counter.load(Ordering::SeqCst);
    let packet_size = client.settings().packet_size as u64;
    assert!(total > DIALER_HANDSHAKE_LEN);
    assert_eq!((total - DIALER_HANDSHAKE_LEN) % packet_size, 0);
    drop(server);
    Ok(())
}
