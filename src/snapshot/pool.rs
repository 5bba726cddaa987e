//! A bounded pool of equally sized snapshot buffers.
//!
//! Snapshots are taken every frame; allocating and freeing multi-megabyte
//! buffers at that rate would dominate the frame budget. The pool keeps a
//! small set of fixed-size buffers and recycles them. It is the sole
//! allocator and freer of snapshot memory: ownership of a buffer moves out
//! on [`acquire`](BufferPool::acquire) and back in on
//! [`release`](BufferPool::release).
//!
//! The pool is owned by the session and only ever touched from the rollback
//! driver thread, so no locking is needed here.

use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide counter so buffers can be traced back to their pool.
static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// A fixed-size byte buffer checked out of a [`BufferPool`].
///
/// The buffer keeps the identity of its pool; returning it to a different
/// pool is a no-op there.
pub struct PoolBuffer {
    bytes: Box<[u8]>,
    pool_id: u32,
    buffer_id: u32,
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the buffer contents, they are megabytes of state
        f.debug_struct("PoolBuffer")
            .field("capacity", &self.bytes.len())
            .field("buffer_id", &self.buffer_id)
            .finish_non_exhaustive()
    }
}

impl PoolBuffer {
    /// The buffer contents.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The buffer contents, mutably.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// The fixed capacity of this buffer in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

/// A bounded pool of equally sized byte buffers.
///
/// `acquire` hands out a free buffer, lazily allocating while fewer than
/// `max_buffers` exist; once the cap is reached and everything is checked
/// out, it returns `None` rather than blocking or growing.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_buffers: usize,
    pool_id: u32,
    next_buffer_id: u32,
    free: Vec<PoolBuffer>,
    /// Buffer ids currently checked out, for double-release detection.
    outstanding: Vec<u32>,
}

impl BufferPool {
    /// Creates a pool of up to `max_buffers` buffers of `buffer_size` bytes
    /// each. One buffer is allocated up front so the first save never pays
    /// for allocation.
    #[must_use]
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        let mut pool = Self {
            buffer_size,
            max_buffers: max_buffers.max(1),
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            next_buffer_id: 0,
            free: Vec::with_capacity(max_buffers),
            outstanding: Vec::with_capacity(max_buffers),
        };
        let first = pool.allocate();
        pool.free.push(first);
        pool
    }

    fn allocate(&mut self) -> PoolBuffer {
        let buffer_id = self.next_buffer_id;
        self.next_buffer_id += 1;
        PoolBuffer {
            bytes: vec![0u8; self.buffer_size].into_boxed_slice(),
            pool_id: self.pool_id,
            buffer_id,
        }
    }

    /// Checks a buffer out of the pool.
    ///
    /// Returns `None` when all `max_buffers` buffers are already in use;
    /// this never blocks.
    #[must_use]
    pub fn acquire(&mut self) -> Option<PoolBuffer> {
        let buffer = match self.free.pop() {
            Some(buffer) => buffer,
            None if self.allocated_count() < self.max_buffers => self.allocate(),
            None => return None,
        };
        self.outstanding.push(buffer.buffer_id);
        Some(buffer)
    }

    /// Returns a buffer to the pool for reuse.
    ///
    /// A buffer belonging to a different pool is dropped without being
    /// added; a buffer this pool does not consider outstanding indicates a
    /// double release, which is a bug and trips a debug assertion.
    pub fn release(&mut self, buffer: PoolBuffer) {
        if buffer.pool_id != self.pool_id {
            debug_assert!(false, "released buffer belongs to a different pool");
            return;
        }
        let Some(position) = self
            .outstanding
            .iter()
            .position(|&id| id == buffer.buffer_id)
        else {
            debug_assert!(false, "double release of pool buffer {}", buffer.buffer_id);
            return;
        };
        self.outstanding.swap_remove(position);
        self.free.push(buffer);
    }

    /// The fixed size of each buffer in bytes.
    #[inline]
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The number of buffers currently checked out.
    #[inline]
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.outstanding.len()
    }

    /// Drops every free buffer, shrinking the pool to only what is still
    /// checked out. Used on shutdown.
    pub fn flush(&mut self) {
        self.free.clear();
    }

    fn allocated_count(&self) -> usize {
        self.free.len() + self.outstanding.len()
    }
}

// #########
// # TESTS #
// #########
