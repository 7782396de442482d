//! plait: a bidirectional stream multiplexer over reliable byte transports.
//!
//! A [`Session`] owns one carrier (any `AsyncRead + AsyncWrite` byte stream)
//! and multiplexes many independent, half-closeable logical [`Stream`]s over
//! it. Frames are varint length-delimited; backpressure comes from bounded
//! queues plus a session-global receive timeout. There is no windowed flow
//! control, no retransmission, and no encryption - the carrier is assumed
//! reliable and ordered.
//!
//! ```ignore
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let client = Session::new(a, true);
//! let server = Session::new(b, false);
//!
//! let mut s = client.new_stream().await?;
//! s.write(b"hello").await?;
//!
//! let mut t = server.accept().await?;
//! let mut buf = [0u8; 16];
//! let n = t.read(&mut buf).await?;
//! ```

pub mod config;
pub mod deadline;
pub mod error;
pub mod frame;
pub mod pool;
pub mod session;
pub mod signal;
pub mod stream;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use pool::{BufferPool, PooledBuf};
pub use session::Session;
pub use stream::Stream;
