//! Varint framing codec.
//!
//! A frame on the wire is three parts: a header varint `(stream_num << 3) |
//! tag`, a length varint, and `length` opaque payload bytes. Varints are
//! unsigned LEB128. The tag's low bit carries the sender's initiator flag
//! for the stream (0 = sender initiated it); the remaining bits select the
//! operation.
//!
//! Reads run over a buffered reader on the carrier's read half; writes build
//! each frame into a single pooled buffer which the writer task later emits
//! with one carrier write.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuf};

/// Operation tags, before the initiator bit is folded in.
pub(crate) const NEW_STREAM_TAG: u64 = 0;
pub(crate) const MESSAGE_TAG: u64 = 2;
pub(crate) const CLOSE_TAG: u64 = 4;
pub(crate) const RESET_TAG: u64 = 6;

/// Longest LEB128 encoding of a u64.
const MAX_VARINT_LEN: u32 = 10;

/// Append the LEB128 encoding of `v` to `buf`.
pub(crate) fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decode one LEB128 varint.
///
/// Returns `Ok(None)` on a clean end of stream before the first byte;
/// truncation mid-varint is `UnexpectedEof` and an encoding longer than a
/// u64 is `InvalidData`.
async fn read_uvarint_opt<R>(r: &mut R) -> io::Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let mut x: u64 = 0;
    let mut shift: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        let n = r.read(&mut byte).await?;
        if n == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated varint",
            ));
        }
        let b = byte[0];
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "varint overflows a 64-bit integer",
                ));
            }
            return Ok(Some(x | (u64::from(b) << shift)));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint overflows a 64-bit integer",
    ))
}

pub(crate) async fn read_uvarint<R>(r: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    read_uvarint_opt(r).await?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "truncated varint")
    })
}

/// Read the next frame header.
///
/// Returns `(stream_num, tag)` or `None` on a clean end of stream at a
/// frame boundary.
pub(crate) async fn read_header<R>(r: &mut R) -> io::Result<Option<(u64, u8)>>
where
    R: AsyncRead + Unpin,
{
    match read_uvarint_opt(r).await? {
        None => Ok(None),
        Some(h) => Ok(Some((h >> 3, (h & 7) as u8))),
    }
}

/// Read the next payload: length varint, then the bytes.
///
/// A declared length above `max_message_size` is [`Error::MessageTooLarge`].
/// Zero-length payloads come back as [`PooledBuf::empty`] without touching
/// the pool.
pub(crate) async fn read_payload<R>(
    r: &mut R,
    pool: &BufferPool,
    max_message_size: usize,
) -> Result<PooledBuf>
where
    R: AsyncRead + Unpin,
{
    let len = read_uvarint(r).await?;
    if len > max_message_size as u64 {
        return Err(Error::MessageTooLarge);
    }
    if len == 0 {
        return Ok(PooledBuf::empty());
    }

    let mut buf = pool.get_sized(len as usize);
    r.read_exact(buf.vec_mut()).await.map_err(Error::from)?;
    Ok(buf)
}

/// Build a fully framed buffer: header varint, length varint, payload.
pub(crate) fn encode_frame(pool: &BufferPool, header: u64, payload: &[u8]) -> PooledBuf {
    let mut buf = pool.get();
    let out = buf.vec_mut();
    put_uvarint(out, header);
    put_uvarint(out, payload.len() as u64);
    out.extend_from_slice(payload);
    buf
}
