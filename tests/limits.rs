//! Backpressure, timeouts, size limits and buffer accounting.

use std::time::{Duration, Instant};

use plait::{Error, Session, SessionConfig, Stream};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

const TICK: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn uvarint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
    out
}

async fn read_full(stream: &mut Stream, n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 4096];
    while out.len() < n {
        let got = timeout(TICK, stream.read(&mut buf))
            .await
            .expect("read should not hang")
            .expect("read should succeed");
        assert_ne!(got, 0, "unexpected end of stream");
        out.extend_from_slice(&buf[..got]);
    }
    out.truncate(n);
    out
}

#[tokio::test]
async fn receive_timeout_resets_only_the_stalled_stream() {
    init_tracing();
    let config = SessionConfig {
        receive_timeout: Duration::from_millis(250),
        ..SessionConfig::default()
    };
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client = Session::with_config(a, true, config.clone());
    let server = Session::with_config(b, false, config);

    let mut stalled = client.new_stream().await.unwrap();
    let mut healthy = client.new_stream().await.unwrap();
    let mut t_stalled = timeout(TICK, server.accept()).await.unwrap().unwrap();
    let mut t_healthy = timeout(TICK, server.accept()).await.unwrap().unwrap();

    // Flood the stream nobody reads; its queue fills, the reader waits out
    // the receive timeout, resets it, and moves on.
    let started = Instant::now();
    for _ in 0..64 {
        if stalled.write(&[0x55; 1024]).await.is_err() {
            break;
        }
    }

    let mut drained = 0usize;
    let mut buf = [0u8; 4096];
    let reset_err = loop {
        match timeout(TICK, t_stalled.read(&mut buf))
            .await
            .expect("stalled stream must reach a terminal state")
        {
            Ok(0) => panic!("expected StreamReset, got end of stream"),
            Ok(n) => drained += n,
            Err(e) => break e,
        }
    };
    assert!(matches!(reset_err, Error::StreamReset), "got {reset_err:?}");
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "reset should land near the receive timeout, took {:?}",
        started.elapsed()
    );
    assert!(drained <= 64 * 1024);

    // The rest of the session is unaffected.
    healthy.write(b"still alive").await.unwrap();
    assert_eq!(read_full(&mut t_healthy, 11).await, b"still alive");
    t_healthy.write(b"ack").await.unwrap();
    assert_eq!(read_full(&mut healthy, 3).await, b"ack");
}

#[tokio::test]
async fn oversize_inbound_frame_terminates_the_session() {
    let (raw, b) = tokio::io::duplex(4096);
    let server = Session::new(b, false);

    // A NEW_STREAM header followed by a length just past the cap.
    let mut wire = Vec::new();
    wire.extend_from_slice(&uvarint(0 << 3));
    wire.extend_from_slice(&uvarint((1 << 20) + 1));
    let (_raw_r, mut raw_w) = tokio::io::split(raw);
    raw_w.write_all(&wire).await.unwrap();

    match timeout(TICK, server.accept()).await.unwrap() {
        Err(Error::MessageTooLarge) => {}
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }
    timeout(TICK, server.close()).await.unwrap().unwrap();
    assert!(server.is_closed());
}

#[tokio::test]
async fn read_deadline_in_the_past_fails_immediately() {
    let (client, server) = pair_default();

    let mut s = client.new_stream().await.unwrap();
    s.write(b"x").await.unwrap();
    let mut t = timeout(TICK, server.accept()).await.unwrap().unwrap();
    read_full(&mut t, 1).await;

    t.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)));
    let started = Instant::now();
    match timeout(TICK, t.read(&mut [0u8; 8])).await.unwrap() {
        Err(Error::Timeout) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn read_deadline_unblocks_and_clears() {
    let (client, server) = pair_default();

    let mut s = client.new_stream().await.unwrap();
    s.write(b"x").await.unwrap();
    let mut t = timeout(TICK, server.accept()).await.unwrap().unwrap();
    read_full(&mut t, 1).await;

    t.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let started = Instant::now();
    let err = timeout(TICK, t.read(&mut [0u8; 8]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_temporary(), "deadline errors are retryable: {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(100));

    // Clearing the deadline makes the next read block until data arrives.
    t.set_read_deadline(None);
    s.write(b"late").await.unwrap();
    assert_eq!(read_full(&mut t, 4).await, b"late");
}

#[tokio::test]
async fn stalled_carrier_times_out_writes_and_new_streams() {
    let config = SessionConfig {
        new_stream_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    // Tiny carrier that nobody reads: the writer task wedges, the write
    // queue fills, and deadline-gated operations start failing.
    let (a, b) = tokio::io::duplex(64);
    let client = Session::with_config(a, true, config);

    let mut s = client.new_stream().await.unwrap();
    s.set_write_deadline(Some(Instant::now() + Duration::from_millis(300)));

    let write_err = loop {
        match timeout(TICK, s.write(&[0u8; 1024])).await.unwrap() {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(write_err, Error::Timeout), "got {write_err:?}");
    assert!(write_err.is_temporary());

    let open_err = timeout(TICK, client.new_stream()).await.unwrap().unwrap_err();
    assert!(matches!(open_err, Error::Timeout), "got {open_err:?}");

    drop(b);
}

#[tokio::test]
async fn buffer_pool_balances_after_a_run() {
    let (client, server) = pair_default();

    for round in 0..4 {
        let mut s = client
            .new_named_stream(&format!("round-{round}"))
            .await
            .unwrap();
        let mut t = timeout(TICK, server.accept()).await.unwrap().unwrap();

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        s.write(&payload).await.unwrap();
        assert_eq!(read_full(&mut t, payload.len()).await, payload);
        t.write(&payload).await.unwrap();
        assert_eq!(read_full(&mut s, payload.len()).await, payload);

        s.close().await.unwrap();
        let mut end = [0u8; 1];
        assert_eq!(t.read(&mut end).await.unwrap(), 0);
        t.close().await.unwrap();
    }

    client.close().await.unwrap();
    server.close().await.unwrap();

    // Queued buffers unwind as the tasks finish; give them a moment.
    let deadline = Instant::now() + TICK;
    loop {
        if client.pool().in_flight() == 0 && server.pool().in_flight() == 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "pool imbalance: client={} server={}",
            client.pool().in_flight(),
            server.pool().in_flight()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn pair_default() -> (Session, Session) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (Session::new(a, true), Session::new(b, false))
}
