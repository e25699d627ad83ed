//! Reusable scratch buffers for read-heavy paths.
//!
//! Buffers are borrowed through [`PooledBuffer`], which hands its storage
//! back to the pool when dropped. Requests larger than the pooled capacity
//! get a one-off allocation that is freed instead of pooled.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Capacity of every pooled buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Idle buffers kept around for reuse.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// A pool of fixed-capacity byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
            max_idle,
        }
    }

    /// Borrow a zeroed buffer of exactly `len` bytes.
    ///
    /// Lengths above the pooled capacity are served by a one-off allocation.
    pub fn get(&self, len: usize) -> PooledBuffer<'_> {
        if len > self.buffer_size {
            return PooledBuffer {
                pool: self,
                buf: vec![0u8; len],
                pooled: false,
            };
        }

        let mut buf = self.take();
        buf.resize(len, 0);
        PooledBuffer {
            pool: self,
            buf,
            pooled: true,
        }
    }

    /// Borrow an empty buffer to append into.
    pub fn get_empty(&self) -> PooledBuffer<'_> {
        PooledBuffer {
            pool: self,
            buf: self.take(),
            pooled: true,
        }
    }

    /// Number of buffers currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    fn take(&self) -> Vec<u8> {
        let reused = match self.free.lock() {
            Ok(mut free) => free.pop(),
            Err(_) => None,
        };
        reused.unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() != self.buffer_size {
            return;
        }
        buf.clear();

        let Ok(mut free) = self.free.lock() else {
            return;
        };
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE)
    }
}

/// A buffer borrowed from a [`BufferPool`].
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
    pooled: bool,
}

impl PooledBuffer<'_> {
    /// Append bytes, moving to a one-off allocation once the pooled
    /// capacity would be exceeded. The pooled entry is never resized.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let needed = self.buf.len() + data.len();
        if self.pooled && needed > self.pool.buffer_size {
            let mut spilled = Vec::with_capacity(needed.max(self.pool.buffer_size * 2));
            spilled.extend_from_slice(&self.buf);
            let pooled = std::mem::replace(&mut self.buf, spilled);
            self.pool.put(pooled);
            self.pooled = false;
        }
        self.buf.extend_from_slice(data);
    }

    /// Whether this buffer will go back to the pool when dropped.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if self.pooled {
            self.pool.put(std::mem::take(&mut self.buf));
        }
    }
}
