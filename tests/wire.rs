//! Wire-level conformance against hand-built frames.

use std::time::Duration;

use plait::{Error, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const TICK: Duration = Duration::from_secs(5);

fn uvarint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
    out
}

#[tokio::test]
async fn emits_the_expected_frames() {
    let (a, raw) = tokio::io::duplex(4096);
    let client = Session::new(a, true);

    let mut s = client.new_named_stream("echo").await.unwrap();
    s.write(b"hi").await.unwrap();
    s.close().await.unwrap();

    // NEW_STREAM, MESSAGE and CLOSE for stream 0, initiator parity bit 0.
    let mut expected = Vec::new();
    expected.extend(uvarint(0 << 3));
    expected.extend(uvarint(4));
    expected.extend_from_slice(b"echo");
    expected.extend(uvarint((0 << 3) | 2));
    expected.extend(uvarint(2));
    expected.extend_from_slice(b"hi");
    expected.extend(uvarint((0 << 3) | 4));
    expected.extend(uvarint(0));

    let (mut raw_r, _raw_w) = tokio::io::split(raw);
    let mut got = vec![0u8; expected.len()];
    timeout(TICK, raw_r.read_exact(&mut got))
        .await
        .expect("frames should arrive")
        .unwrap();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn accepts_hand_built_frames() {
    let (raw, b) = tokio::io::duplex(4096);
    let server = Session::new(b, false);

    let mut wire = Vec::new();
    wire.extend(uvarint(5 << 3));
    wire.extend(uvarint(3));
    wire.extend_from_slice(b"abc");
    wire.extend(uvarint((5 << 3) | 2));
    wire.extend(uvarint(4));
    wire.extend_from_slice(b"data");
    wire.extend(uvarint((5 << 3) | 4));
    wire.extend(uvarint(0));

    let (_raw_r, mut raw_w) = tokio::io::split(raw);
    raw_w.write_all(&wire).await.unwrap();

    let mut t = timeout(TICK, server.accept()).await.unwrap().unwrap();
    assert_eq!(t.id(), 5);
    assert!(!t.is_initiator(), "the peer initiated this stream");
    assert_eq!(t.name(), "abc");

    let mut buf = [0u8; 16];
    let n = timeout(TICK, t.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"data");
    let n = timeout(TICK, t.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "CLOSE lands after the data");
}

#[tokio::test]
async fn duplicate_new_stream_is_a_protocol_error() {
    let (raw, b) = tokio::io::duplex(4096);
    let server = Session::new(b, false);

    let mut wire = Vec::new();
    for _ in 0..2 {
        wire.extend(uvarint(0 << 3));
        wire.extend(uvarint(0));
    }

    let (_raw_r, mut raw_w) = tokio::io::split(raw);
    raw_w.write_all(&wire).await.unwrap();

    let first = timeout(TICK, server.accept()).await.unwrap().unwrap();
    assert_eq!(first.id(), 0);

    match timeout(TICK, server.accept()).await.unwrap() {
        Err(Error::InvalidState) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }
    timeout(TICK, server.close()).await.unwrap().unwrap();
}

#[tokio::test]
async fn non_initiator_reset_lands_on_the_initiated_stream() {
    let (raw, b) = tokio::io::duplex(4096);
    let session = Session::new(b, false);

    let mut s = session.new_stream().await.unwrap();
    assert_eq!(s.id(), 0);

    // Wire tag 7 is RESET with the parity bit saying "sender did not
    // initiate", so it addresses the stream we opened.
    let mut wire = Vec::new();
    wire.extend(uvarint((0 << 3) | 7));
    wire.extend(uvarint(0));

    let (_raw_r, mut raw_w) = tokio::io::split(raw);
    raw_w.write_all(&wire).await.unwrap();

    let err = loop {
        match timeout(TICK, s.read(&mut [0u8; 8]))
            .await
            .expect("stream should be reset, not hang")
        {
            Ok(0) => panic!("expected StreamReset, got end of stream"),
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::StreamReset), "got {err:?}");

    // The reset aborts the write direction too.
    match s.write(b"after").await {
        Err(Error::StreamReset) => {}
        other => panic!("expected StreamReset, got {other:?}"),
    }
}
