//! Buffer pool for frame payload allocation.
//!
//! Every inbound payload and every outbound frame lives in a [`PooledBuf`]
//! drawn from a [`BufferPool`], so a busy session reuses a small set of
//! allocations instead of allocating per frame. Buffers return to the pool
//! when dropped, wherever that drop happens: the stream consumer, a
//! reset/timeout discard path, or the writer task after the carrier write.
//!
//! The pool tracks how many buffers are currently out; tests use
//! [`BufferPool::in_flight`] to assert the allocation/return balance after a
//! run.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use object_pool::Pool;

/// Default buffer capacity for pooled allocations (64KB).
///
/// Large enough for most frames; payloads beyond this grow the vector, which
/// then stays grown when the buffer re-enters the pool.
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default pool capacity (number of buffers retained when idle).
const DEFAULT_POOL_CAPACITY: usize = 128;

/// A thread-safe pool of reusable byte buffers.
///
/// Cloning is cheap; all clones share the same pool.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_size: usize,
    live: Arc<AtomicUsize>,
}

impl BufferPool {
    /// Create a pool with default capacity and buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool retaining up to `capacity` buffers of `buffer_size`
    /// bytes each.
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let pool = Pool::new(capacity, move || Vec::with_capacity(buffer_size));
        Self {
            pool: Arc::new(pool),
            buffer_size,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get an empty buffer from the pool.
    pub fn get(&self) -> PooledBuf {
        let mut reusable = self
            .pool
            .clone()
            .pull_owned(|| Vec::with_capacity(self.buffer_size));
        reusable.clear();
        self.live.fetch_add(1, Ordering::Relaxed);

        PooledBuf {
            inner: Some(reusable),
            live: Some(self.live.clone()),
        }
    }

    /// Get a buffer from the pool, zeroed to exactly `len` bytes.
    pub fn get_sized(&self, len: usize) -> PooledBuf {
        let mut buf = self.get();
        buf.vec_mut().resize(len, 0);
        buf
    }

    /// The configured per-buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently checked out of the pool.
    pub fn in_flight(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A byte buffer that returns to its pool when dropped.
///
/// Zero-length payloads are represented by [`PooledBuf::empty`], which holds
/// no pool storage at all.
pub struct PooledBuf {
    inner: Option<object_pool::ReusableOwned<Vec<u8>>>,
    live: Option<Arc<AtomicUsize>>,
}

impl PooledBuf {
    /// An empty buffer backed by no pool storage.
    pub fn empty() -> Self {
        Self {
            inner: None,
            live: None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutable access to the backing vector for frame building.
    pub(crate) fn vec_mut(&mut self) -> &mut Vec<u8> {
        self.inner
            .as_deref_mut()
            .expect("pooled buffer has backing storage")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.inner.as_deref().map_or(&[], |v| v.as_slice())
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len())
            .field("pooled", &self.inner.is_some())
            .finish()
    }
}
