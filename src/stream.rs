//! Logical streams carried inside a session.
//!
//! A [`Stream`] is one bidirectional channel multiplexed over the session's
//! carrier. Reads drain a bounded inbound queue fed by the session's reader
//! task; writes frame the caller's bytes and hand them to the session's
//! writer task. Each direction closes independently: a local close sends
//! CLOSE and stops writes, a remote CLOSE ends reads once the queue drains,
//! and a reset from either side aborts both directions at once.
//!
//! The stream table holds an [`StreamShared`] per live stream; the
//! application's `Stream` handle keeps a reference to it plus the queue
//! receiver, so a handle outliving the table entry simply observes terminal
//! results.

use std::cmp;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::frame::{self, encode_frame};
use crate::pool::PooledBuf;
use crate::session::SessionShared;
use crate::signal::Signal;

/// A stream's identity within a session: the wire number plus which side
/// opened it. Both sides number their own streams from zero, so the flag is
/// what keeps the two id spaces apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StreamId {
    pub(crate) num: u64,
    pub(crate) initiator: bool,
}

impl StreamId {
    /// Wire header for a frame we send on this stream. The low bit carries
    /// our role: 0 when we initiated the stream, 1 when the peer did.
    pub(crate) fn header(&self, tag: u64) -> u64 {
        let mut header = (self.num << 3) | tag;
        if !self.initiator {
            header |= 1;
        }
        header
    }
}

/// Close bookkeeping guarded by the per-stream lock, kept separate from the
/// stream table lock so close transitions never widen its critical section.
pub(crate) struct CloseState {
    pub(crate) closed_remote: bool,
}

/// Per-stream state shared between the session tasks and the handle.
pub(crate) struct StreamShared {
    pub(crate) id: StreamId,
    pub(crate) name: String,
    protocol: Mutex<String>,

    /// Sender half of the inbound payload queue. Taken (dropped) on remote
    /// CLOSE so the receiver sees end-of-stream after draining.
    pub(crate) data_tx: Mutex<Option<mpsc::Sender<PooledBuf>>>,

    /// Latched when the stream is reset, by either side.
    pub(crate) reset: Signal,
    /// Latched when the local side closes (half-close or reset).
    pub(crate) closed_local: Signal,
    pub(crate) close_lock: Mutex<CloseState>,

    pub(crate) read_deadline: Deadline,
    pub(crate) write_deadline: Deadline,
}

impl StreamShared {
    pub(crate) fn cancel_deadlines(&self) {
        self.read_deadline.cancel();
        self.write_deadline.cancel();
    }
}

/// Build the shared record and the application handle for one stream.
pub(crate) fn pair(
    session: Arc<SessionShared>,
    id: StreamId,
    name: String,
) -> (Arc<StreamShared>, Stream) {
    let (data_tx, data_rx) = mpsc::channel(session.config.stream_backlog.max(1));
    let shared = Arc::new(StreamShared {
        id,
        name,
        protocol: Mutex::new(String::new()),
        data_tx: Mutex::new(Some(data_tx)),
        reset: Signal::new(),
        closed_local: Signal::new(),
        close_lock: Mutex::new(CloseState {
            closed_remote: false,
        }),
        read_deadline: Deadline::new(),
        write_deadline: Deadline::new(),
    });
    let stream = Stream {
        shared: shared.clone(),
        session,
        data_rx,
        read_buf: PooledBuf::empty(),
        read_pos: 0,
    };
    (shared, stream)
}

/// One bidirectional logical stream.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Arc<SessionShared>,
    data_rx: mpsc::Receiver<PooledBuf>,
    /// Residue of a partially consumed inbound chunk.
    read_buf: PooledBuf,
    read_pos: usize,
}

impl Stream {
    /// The stream's wire number. Unique only together with
    /// [`is_initiator`](Self::is_initiator).
    pub fn id(&self) -> u64 {
        self.shared.id.num
    }

    /// True if this side opened the stream.
    pub fn is_initiator(&self) -> bool {
        self.shared.id.initiator
    }

    /// Diagnostic name: the opener's label, or the decimal stream number.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Application-level protocol label. Never sent on the wire.
    pub fn protocol(&self) -> String {
        self.shared.protocol.lock().clone()
    }

    pub fn set_protocol(&self, protocol: impl Into<String>) {
        *self.shared.protocol.lock() = protocol.into();
    }

    /// Read the next bytes from the stream.
    ///
    /// Returns `Ok(0)` at end of stream: the peer closed its side and every
    /// payload it sent before the close has been delivered. Fails with
    /// [`Error::StreamReset`] after a reset, [`Error::Timeout`] when the
    /// read deadline passes (temporary), or [`Error::Shutdown`] when the
    /// session dies.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // Serve residue from the previous chunk first.
            if self.read_pos < self.read_buf.len() {
                let n = cmp::min(buf.len(), self.read_buf.len() - self.read_pos);
                buf[..n].copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
                self.read_pos += n;
                if self.read_pos == self.read_buf.len() {
                    self.read_buf = PooledBuf::empty();
                    self.read_pos = 0;
                }
                return Ok(n);
            }

            // Drain anything already queued before consulting signals, so
            // data that preceded a close or reset is still delivered.
            match self.data_rx.try_recv() {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.read_buf = chunk;
                    self.read_pos = 0;
                    continue;
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return self.end_of_queue();
                }
            }

            let shared = &self.shared;
            let session = &self.session;
            tokio::select! {
                biased;
                chunk = self.data_rx.recv() => match chunk {
                    Some(chunk) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        self.read_buf = chunk;
                        self.read_pos = 0;
                    }
                    None => {
                        return if shared.reset.is_set() {
                            Err(Error::StreamReset)
                        } else {
                            Ok(0)
                        };
                    }
                },
                _ = shared.reset.wait() => return Err(Error::StreamReset),
                _ = shared.read_deadline.wait() => return Err(Error::Timeout),
                _ = session.shutdown.wait() => return Err(Error::Shutdown),
            }
        }
    }

    fn end_of_queue(&self) -> Result<usize> {
        if self.shared.reset.is_set() {
            Err(Error::StreamReset)
        } else {
            Ok(0)
        }
    }

    /// Write the caller's bytes, splitting them into frames no larger than
    /// the session's maximum message size.
    ///
    /// Fails with [`Error::StreamClosed`] once the local side is closed,
    /// [`Error::StreamReset`] after a reset, [`Error::Timeout`] when the
    /// write deadline passes (temporary), or [`Error::Shutdown`] when the
    /// session dies.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let max = self.session.config.max_message_size.max(1);
        let mut written = 0;
        for chunk in buf.chunks(max) {
            self.write_chunk(chunk).await?;
            written += chunk.len();
        }
        Ok(written)
    }

    async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        if self.shared.reset.is_set() {
            return Err(Error::StreamReset);
        }
        if self.shared.closed_local.is_set() {
            return Err(Error::StreamClosed);
        }

        let frame = encode_frame(
            &self.session.pool,
            self.shared.id.header(frame::MESSAGE_TAG),
            chunk,
        );
        tokio::select! {
            biased;
            _ = self.shared.reset.wait() => Err(Error::StreamReset),
            _ = self.shared.closed_local.wait() => Err(Error::StreamClosed),
            _ = self.shared.write_deadline.wait() => Err(Error::Timeout),
            _ = self.session.shutdown.wait() => Err(Error::Shutdown),
            res = self.session.write_tx.send(frame) => res.map_err(|_| Error::Shutdown),
        }
    }

    /// Half-close: tell the peer we will send no more data. Reads remain
    /// valid until the peer closes its own side.
    ///
    /// Idempotent; a second call returns `Ok(())`. If the CLOSE frame
    /// cannot be queued before the reset-stream timeout (or the session
    /// shuts down first) the stream is reset locally and the error
    /// returned.
    pub async fn close(&self) -> Result<()> {
        let remote_done = {
            let state = self.shared.close_lock.lock();
            if self.shared.closed_local.is_set() {
                return Ok(());
            }
            self.shared.closed_local.trigger();
            state.closed_remote
        };
        if remote_done {
            self.shared.cancel_deadlines();
            self.session.remove_stream(&self.shared.id);
        }

        let frame = encode_frame(
            &self.session.pool,
            self.shared.id.header(frame::CLOSE_TAG),
            &[],
        );
        let res = tokio::select! {
            res = self.session.write_tx.send(frame) => res.map_err(|_| Error::Shutdown),
            _ = tokio::time::sleep(self.session.config.reset_stream_timeout) => {
                Err(Error::Timeout)
            }
            _ = self.session.shutdown.wait() => Err(Error::Shutdown),
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                // The peer never hears about the close; abort the stream
                // instead of leaving it half-open forever.
                self.shared.reset.trigger();
                self.shared.close_lock.lock().closed_remote = true;
                self.shared.cancel_deadlines();
                self.session.remove_stream(&self.shared.id);
                Err(e)
            }
        }
    }

    /// Abort the stream in both directions.
    ///
    /// Safe to call any number of times. The RESET frame is sent in the
    /// background; a send failure is logged and, if the carrier looks dead,
    /// the session is closed.
    pub fn reset(&self) {
        crate::session::reset_stream(&self.session, &self.shared, true);
    }

    /// Set the read deadline. `None` means no deadline. A blocked read
    /// observes the new deadline immediately.
    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.shared.read_deadline.set(at);
    }

    /// Set the write deadline. `None` means no deadline. A blocked write
    /// observes the new deadline immediately.
    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.shared.write_deadline.set(at);
    }

    /// Set both deadlines at once.
    pub fn set_deadline(&self, at: Option<Instant>) {
        self.shared.read_deadline.set(at);
        self.shared.write_deadline.set(at);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id.num)
            .field("initiator", &self.shared.id.initiator)
            .field("name", &self.shared.name)
            .finish()
    }
}
