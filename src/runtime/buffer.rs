//! Shared connection buffer pool.
//!
//! Provides fixed-size buffers without per-connection malloc once the pool
//! is warm. The pool is bounded: at most `capacity` buffers may be checked
//! out at once, and an exhausted pool is how buffer allocation fails.
//!
//! Buffers are handed out as [`PooledBuffer`] guards. A guard owns its bytes
//! exclusively for the lifetime of one connection worker and returns them to
//! the pool when dropped.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bounded pool of fixed-size buffers shared by all workers.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    /// Maximum number of buffers checked out at once.
    capacity: usize,
    /// Size of each buffer.
    buffer_size: usize,
}

struct PoolInner {
    /// Returned buffers kept for reuse (LIFO for cache locality).
    free_list: Vec<Vec<u8>>,
    /// Buffers currently owned by a guard.
    in_use: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of buffers in use at the same time
    /// * `size` - Size of each buffer in bytes
    pub fn new(capacity: usize, size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                free_list: Vec::new(),
                in_use: 0,
            }),
            capacity,
            buffer_size: size,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a zeroed buffer from the pool.
    ///
    /// Returns `None` if every buffer is already checked out.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        let mut inner = self.lock();
        if inner.in_use >= self.capacity {
            return None;
        }
        inner.in_use += 1;
        let buf = inner
            .free_list
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        drop(inner);

        Some(PooledBuffer {
            buf,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.fill(0);
        let mut inner = self.lock();
        inner.in_use -= 1;
        inner.free_list.push(buf);
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of buffers checked out at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers that can still be acquired.
    pub fn available(&self) -> usize {
        self.capacity - self.lock().in_use
    }
}

/// A buffer checked out of a [`BufferPool`].
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
