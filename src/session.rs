//! The multiplexer session: one carrier, many streams.
//!
//! A session owns the carrier and runs exactly two tasks for its lifetime:
//! a reader and a writer. All frame routing happens through bounded
//! channels; nothing else touches the carrier.
//!
//! ```text
//!                 ┌──────────────────────────────────┐
//!                 │             Session              │
//!                 │  channels: Mutex<Option<table>>  │
//!                 │  write queue (16) ── writer task ──▶ carrier
//!                 │  accept queue (16) ◀─ reader task ◀─ carrier
//!                 └──────────────────────────────────┘
//!                                 │ reader dispatch
//!        ┌──────────────┬─────────┴──────┬──────────────┐
//!   NEW_STREAM      MESSAGE           CLOSE          RESET
//!   insert+accept   stream queue      end reads      abort both
//!                   (receive-timeout  after drain    directions
//!                    guard)
//! ```
//!
//! The reader task is the only writer of the stream table's lifecycle: it
//! installs accepted streams, reaps closed ones, and on exit runs the
//! cleanup that fails every remaining stream and latches the session error.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::frame::{self, encode_frame};
use crate::pool::{BufferPool, PooledBuf};
use crate::signal::Signal;
use crate::stream::{self, Stream, StreamId, StreamShared};

/// Upper bound on one coalesced carrier write.
const COALESCE_LIMIT: usize = 64 * 1024;

struct ChannelTable {
    next_id: u64,
    map: HashMap<StreamId, Arc<StreamShared>>,
}

/// Session state shared by the tasks and every handle.
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) is_initiator: bool,
    pub(crate) pool: BufferPool,

    /// The stream table. `None` is the post-shutdown sentinel: every
    /// lookup and creation fails with `Shutdown` once the table is gone.
    channels: Mutex<Option<ChannelTable>>,

    pub(crate) write_tx: mpsc::Sender<PooledBuf>,

    /// Latched when the session starts shutting down.
    pub(crate) shutdown: Signal,
    /// Latched when the reader's cleanup has finished.
    pub(crate) closed: Signal,
    shutdown_err: Mutex<Option<Error>>,
}

impl SessionShared {
    fn lookup(&self, id: &StreamId) -> Option<Arc<StreamShared>> {
        self.channels
            .lock()
            .as_ref()
            .and_then(|table| table.map.get(id).cloned())
    }

    pub(crate) fn remove_stream(&self, id: &StreamId) {
        if let Some(table) = self.channels.lock().as_mut() {
            table.map.remove(id);
        }
    }

    fn latch_error(&self, e: Error) {
        let mut err = self.shutdown_err.lock();
        if err.is_none() {
            *err = Some(e);
        }
    }

    fn shutdown_error(&self) -> Error {
        self.shutdown_err
            .lock()
            .clone()
            .unwrap_or(Error::Shutdown)
    }

    /// Begin shutdown without waiting for cleanup. Idempotent.
    pub(crate) fn close_no_wait(&self) {
        if self.shutdown.trigger() {
            debug!(initiator = self.is_initiator, "session shutting down");
        }
    }

    async fn send_reset_frame(self: Arc<Self>, header: u64, hard: bool) {
        let frame = encode_frame(&self.pool, header, &[]);
        let res = tokio::select! {
            res = self.write_tx.send(frame) => res.map_err(|_| Error::Shutdown),
            _ = tokio::time::sleep(self.config.reset_stream_timeout) => Err(Error::Timeout),
            _ = self.shutdown.wait() => Err(Error::Shutdown),
        };
        if let Err(e) = res {
            if !self.shutdown.is_set() {
                if hard {
                    warn!(error = %e, "could not send reset frame; closing session");
                    self.close_no_wait();
                } else {
                    debug!(error = %e, "could not send reset frame");
                }
            }
        }
    }

    /// Peer reset the stream: abort both directions and forget it.
    fn handle_remote_reset(&self, sh: &Arc<StreamShared>) {
        {
            let mut state = sh.close_lock.lock();
            if !state.closed_remote {
                sh.reset.trigger();
                state.closed_remote = true;
            }
            sh.closed_local.trigger();
        }
        sh.cancel_deadlines();
        self.remove_stream(&sh.id);
    }

    /// Peer half-closed: end reads after the queue drains; reap the stream
    /// once both sides are closed.
    fn handle_remote_close(&self, sh: &Arc<StreamShared>) {
        let fully_closed = {
            let mut state = sh.close_lock.lock();
            if state.closed_remote {
                // A second CLOSE is a bug on the peer's side.
                debug!(stream = sh.id.num, "peer closed an already-closed stream");
                return;
            }
            state.closed_remote = true;
            sh.closed_local.is_set()
        };
        sh.data_tx.lock().take();
        if fully_closed {
            sh.cancel_deadlines();
            self.remove_stream(&sh.id);
        }
    }

    async fn run_reader<R>(self: Arc<Self>, mut io: R, accept_tx: mpsc::Sender<Stream>)
    where
        R: AsyncRead + Unpin,
    {
        if let Err(e) = read_loop(&self, &mut io, &accept_tx).await {
            self.latch_error(e);
        }
        self.cleanup();
    }

    /// Runs exactly once, from the reader task's exit path. Fails every
    /// remaining stream, replaces the table with the shutdown sentinel,
    /// latches the session error and signals `closed`.
    fn cleanup(&self) {
        self.close_no_wait();
        let table = self.channels.lock().take();
        if let Some(table) = table {
            for sh in table.map.into_values() {
                {
                    let mut state = sh.close_lock.lock();
                    if !state.closed_remote {
                        sh.reset.trigger();
                        state.closed_remote = true;
                    }
                    sh.closed_local.trigger();
                }
                sh.data_tx.lock().take();
                sh.cancel_deadlines();
            }
        }
        {
            let mut err = self.shutdown_err.lock();
            if err.is_none() {
                *err = Some(Error::Shutdown);
            }
        }
        self.closed.trigger();
    }

    async fn run_writer<W>(self: Arc<Self>, mut io: W, mut rx: mpsc::Receiver<PooledBuf>)
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let buf = tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                buf = rx.recv() => match buf {
                    Some(buf) => buf,
                    None => return,
                },
            };

            // Racing the carrier write against shutdown is what unblocks a
            // wedged writer when the session closes.
            let res = tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                res = write_frames(&self, &mut io, &mut rx, buf) => res,
            };

            if let Err(e) = res {
                if !self.shutdown.is_set() {
                    warn!(error = %e, "error writing frame to carrier");
                }
                self.close_no_wait();
                return;
            }
            // On success the buffer drops here and returns to the pool; on
            // task exit the write half drops, closing the carrier's write
            // side.
        }
    }
}

/// Emit one dequeued frame, optionally coalescing adjacent queued frames
/// into the same carrier write.
async fn write_frames<W>(
    shared: &SessionShared,
    io: &mut W,
    rx: &mut mpsc::Receiver<PooledBuf>,
    first: PooledBuf,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !shared.config.write_coalescing {
        return io.write_all(&first).await;
    }

    let mut batch = shared.pool.get();
    batch.vec_mut().extend_from_slice(&first);
    drop(first);
    while batch.len() < COALESCE_LIMIT {
        match rx.try_recv() {
            Ok(next) => batch.vec_mut().extend_from_slice(&next),
            Err(_) => break,
        }
    }
    io.write_all(&batch).await
}

/// Abort a stream in both directions and reap it from the table.
///
/// The RESET frame goes out in the background, bounded by the reset-stream
/// timeout. A `hard` reset that cannot be sent while the session is still
/// alive closes the whole session; a soft one only logs.
pub(crate) fn reset_stream(
    session: &Arc<SessionShared>,
    sh: &Arc<StreamShared>,
    hard: bool,
) {
    let send_frame = {
        let mut state = sh.close_lock.lock();
        if sh.closed_local.is_set() && state.closed_remote {
            return;
        }
        let first = sh.reset.trigger();
        state.closed_remote = true;
        sh.closed_local.trigger();
        first
    };
    sh.cancel_deadlines();
    session.remove_stream(&sh.id);

    if send_frame {
        let session = session.clone();
        let header = sh.id.header(frame::RESET_TAG);
        tokio::spawn(async move { session.send_reset_frame(header, hard).await });
    }
}

async fn read_loop<R>(
    session: &Arc<SessionShared>,
    io: &mut R,
    accept_tx: &mpsc::Sender<Stream>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let header = tokio::select! {
            biased;
            _ = session.shutdown.wait() => return Ok(()),
            header = frame::read_header(io) => header?,
        };
        let Some((num, tag)) = header else {
            debug!("carrier closed by peer");
            return Ok(());
        };

        // The tag's low bit is the sender's role; our table key uses the
        // mirrored value.
        let id = StreamId {
            num,
            initiator: tag & 1 == 1,
        };
        // Clear the parity bit to get the operation base: {0,1}->0,
        // {2,3}->2, {4,5}->4, {6,7}->6.
        let op = u64::from(tag & !1);

        let payload = tokio::select! {
            biased;
            _ = session.shutdown.wait() => return Ok(()),
            payload = frame::read_payload(io, &session.pool, session.config.max_message_size) => {
                payload?
            }
        };

        let existing = session.lookup(&id);

        match op {
            frame::NEW_STREAM_TAG => {
                if existing.is_some() {
                    debug!(stream = id.num, "new-stream for an existing stream");
                    return Err(Error::InvalidState);
                }
                let name = String::from_utf8_lossy(&payload).into_owned();
                drop(payload);

                let stream = {
                    let mut guard = session.channels.lock();
                    let Some(table) = guard.as_mut() else {
                        return Ok(());
                    };
                    let (shared, stream) = stream::pair(session.clone(), id, name);
                    table.map.insert(id, shared);
                    stream
                };
                tokio::select! {
                    biased;
                    _ = session.shutdown.wait() => return Ok(()),
                    res = accept_tx.send(stream) => {
                        if res.is_err() {
                            // Every session handle is gone; nobody can ever
                            // accept.
                            return Ok(());
                        }
                    }
                }
            }
            frame::MESSAGE_TAG => {
                let Some(sh) = existing else {
                    // Valid: we forget streams on reset.
                    trace!(stream = id.num, "dropping message for unknown stream");
                    continue;
                };
                if sh.close_lock.lock().closed_remote {
                    warn!(stream = id.num, "received data after stream was closed by peer");
                    continue;
                }
                let sender = sh.data_tx.lock().clone();
                let Some(sender) = sender else {
                    warn!(stream = id.num, "received data after stream was closed by peer");
                    continue;
                };
                tokio::select! {
                    biased;
                    _ = sh.reset.wait() => {}
                    _ = session.shutdown.wait() => return Ok(()),
                    res = sender.send(payload) => {
                        if res.is_err() {
                            // The application dropped its handle.
                            debug!(stream = id.num, "stream handle dropped; resetting");
                            reset_stream(session, &sh, false);
                        }
                    }
                    _ = tokio::time::sleep(session.config.receive_timeout) => {
                        warn!(stream = id.num, "timeout receiving message in stream queue");
                        // Resetting here, synchronously, keeps the
                        // drop-then-reset order: no later message can slip
                        // into the queue first.
                        reset_stream(session, &sh, true);
                    }
                }
            }
            frame::CLOSE_TAG => {
                if let Some(sh) = existing {
                    session.handle_remote_close(&sh);
                }
            }
            frame::RESET_TAG => {
                if let Some(sh) = existing {
                    session.handle_remote_reset(&sh);
                }
            }
            _ => {
                debug!(stream = id.num, tag, "message with unknown tag");
                if let Some(sh) = existing {
                    reset_stream(session, &sh, true);
                }
            }
        }
    }
}

/// A multiplexer session over one carrier.
///
/// Cloning is cheap; clones share the session, and `accept` may be called
/// from any of them.
pub struct Session {
    shared: Arc<SessionShared>,
    accept_rx: Arc<AsyncMutex<mpsc::Receiver<Stream>>>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            accept_rx: self.accept_rx.clone(),
        }
    }
}

impl Session {
    /// Start a session over `carrier` with the default configuration.
    ///
    /// `is_initiator` records which side dialed; it does not change the
    /// protocol, both sides open and accept streams symmetrically.
    pub fn new<C>(carrier: C, is_initiator: bool) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(carrier, is_initiator, SessionConfig::default())
    }

    /// Start a session with explicit tunables.
    pub fn with_config<C>(carrier: C, is_initiator: bool, config: SessionConfig) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(carrier);
        let (write_tx, write_rx) = mpsc::channel(config.write_backlog.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(SessionShared {
            config,
            is_initiator,
            pool: BufferPool::new(),
            channels: Mutex::new(Some(ChannelTable {
                next_id: 0,
                map: HashMap::new(),
            })),
            write_tx,
            shutdown: Signal::new(),
            closed: Signal::new(),
            shutdown_err: Mutex::new(None),
        });

        tokio::spawn(
            shared
                .clone()
                .run_reader(BufReader::new(read_half), accept_tx),
        );
        tokio::spawn(shared.clone().run_writer(write_half, write_rx));

        Session {
            shared,
            accept_rx: Arc::new(AsyncMutex::new(accept_rx)),
        }
    }

    /// Open a new stream named by its decimal id.
    pub async fn new_stream(&self) -> Result<Stream> {
        self.new_named_stream("").await
    }

    /// Open a new stream with a diagnostic name.
    ///
    /// The record is installed before the NEW_STREAM frame is queued; if
    /// queueing misses the new-stream timeout the record is left for the
    /// shutdown path to reap.
    pub async fn new_named_stream(&self, name: &str) -> Result<Stream> {
        let shared = &self.shared;
        let (stream, header, name) = {
            let mut guard = shared.channels.lock();
            let table = guard.as_mut().ok_or(Error::Shutdown)?;
            let num = table.next_id;
            table.next_id += 1;

            let id = StreamId {
                num,
                initiator: true,
            };
            let name = if name.is_empty() {
                num.to_string()
            } else {
                name.to_owned()
            };
            let (sh, stream) = stream::pair(shared.clone(), id, name.clone());
            table.map.insert(id, sh);
            (stream, id.header(frame::NEW_STREAM_TAG), name)
        };

        let frame = encode_frame(&shared.pool, header, name.as_bytes());
        tokio::select! {
            res = shared.write_tx.send(frame) => res.map_err(|_| Error::Shutdown)?,
            _ = tokio::time::sleep(shared.config.new_stream_timeout) => {
                return Err(Error::Timeout);
            }
            _ = shared.shutdown.wait() => return Err(Error::Shutdown),
        }
        Ok(stream)
    }

    /// Accept the next stream the peer opened.
    ///
    /// Queued streams are drained even while the session shuts down; after
    /// that, a cleanly closed session reports [`Error::ClosedMultiplex`]
    /// and an errored one reports its latched error.
    pub async fn accept(&self) -> Result<Stream> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            stream = rx.recv() => match stream {
                Some(stream) => Ok(stream),
                None => Err(self.queue_closed_error()),
            },
            _ = self.shared.closed.wait() => Err(self.shared.shutdown_error()),
        }
    }

    fn queue_closed_error(&self) -> Error {
        match self.shared.shutdown_error() {
            Error::Shutdown => Error::ClosedMultiplex,
            e => e,
        }
    }

    /// Shut the session down and wait for the reader's cleanup to finish.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shared.close_no_wait();
        self.shared.closed.wait().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_set()
    }

    pub fn is_initiator(&self) -> bool {
        self.shared.is_initiator
    }

    /// The session's payload buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("initiator", &self.shared.is_initiator)
            .field("closed", &self.is_closed())
            .finish()
    }
}
