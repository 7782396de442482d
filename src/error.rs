//! Error types for sessions and streams.

use std::fmt;
use std::io;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by session and stream operations.
///
/// The session latches the first terminal error it encounters; that latched
/// value is returned from every subsequent `accept`/`new_stream`, which is
/// why this type is `Clone` (carrier failures are shared as
/// `Arc<io::Error>`).
#[derive(Debug, Clone)]
pub enum Error {
    /// The session is shut down, locally or by the peer.
    Shutdown,
    /// Both sides believe they initiated the session. Reserved for
    /// handshake layers; the core never emits it.
    TwoInitiators,
    /// The peer sent a message inconsistent with the protocol, e.g. a
    /// NEW_STREAM reusing a live identity. Terminates the session.
    InvalidState,
    /// An inbound frame declared a payload larger than the configured
    /// maximum. Terminates the session.
    MessageTooLarge,
    /// A read, write, open or close missed its deadline. Temporary:
    /// callers may retry with a larger deadline.
    Timeout,
    /// The stream was reset, locally or by the peer.
    StreamReset,
    /// The local side of the stream is already closed.
    StreamClosed,
    /// The accept queue is closed and drained.
    ClosedMultiplex,
    /// Carrier I/O failure.
    Io(Arc<io::Error>),
}

impl Error {
    /// True for deadline-driven failures that may succeed when retried
    /// with a larger deadline.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Shutdown => write!(f, "session shut down"),
            Error::TwoInitiators => write!(f, "two initiators"),
            Error::InvalidState => {
                write!(f, "received an unexpected message from the peer")
            }
            Error::MessageTooLarge => write!(f, "message size too large"),
            Error::Timeout => write!(f, "i/o deadline exceeded"),
            Error::StreamReset => write!(f, "stream reset"),
            Error::StreamClosed => write!(f, "stream closed"),
            Error::ClosedMultiplex => write!(f, "multiplex closed"),
            Error::Io(e) => write!(f, "carrier i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}
