//! Reusable byte-buffer pool.
//!
//! Serialization, compression, and chunking all want short-lived buffers on
//! the per-event path. The pool hands out cleared buffers with a guaranteed
//! minimum capacity and takes consumed ones back, keeping allocator traffic
//! off the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Default minimum capacity of a pooled buffer.
pub const DEFAULT_MIN_CAPACITY: usize = 4 * 1024;

/// Default cap on the number of idle buffers retained.
pub const DEFAULT_MAX_POOLED: usize = 64;

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// `get` calls served from the pool.
    pub hits: u64,
    /// `get` calls that had to allocate.
    pub misses: u64,
    /// Buffers currently idle in the pool.
    pub idle: usize,
}

/// Thread-safe pool of reusable `Vec<u8>` buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    min_capacity: usize,
    max_pooled: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CAPACITY, DEFAULT_MAX_POOLED)
    }
}

impl BufferPool {
    /// Create a pool handing out buffers of at least `min_capacity` bytes,
    /// retaining at most `max_pooled` idle buffers.
    pub fn new(min_capacity: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled.min(16))),
            min_capacity,
            max_pooled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Take a cleared buffer with at least the pool's minimum capacity.
    pub fn get(&self) -> Vec<u8> {
        let reused = {
            let mut buffers = self
                .buffers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            buffers.pop()
        };
        match reused {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug_assert!(buf.is_empty());
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.min_capacity)
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is cleared before being retained. Buffers that grew past
    /// four times the minimum capacity are dropped instead of pooled, so one
    /// oversized event cannot pin its allocation forever.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() < self.min_capacity || buf.capacity() >= self.min_capacity * 4 {
            return;
        }
        let mut buffers = self
            .buffers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    /// Current pool activity counters.
    pub fn stats(&self) -> PoolStats {
        let idle = self
            .buffers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_empty_buffer_with_capacity() {
        let pool = BufferPool::new(256, 4);
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 256);
        assert_eq!(pool.stats().misses, 1);
    }

    #[test]
    fn put_then_get_reuses_the_buffer() {
        let pool = BufferPool::new(256, 4);
        let mut buf = pool.get();
        buf.extend_from_slice(b"payload");
        pool.put(buf);

        let again = pool.get();
        assert!(again.is_empty());
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn oversized_buffers_are_not_retained() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.get();
        buf.reserve(64 * 8);
        pool.put(buf);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn pool_size_is_bounded() {
        let pool = BufferPool::new(64, 2);
        for _ in 0..5 {
            pool.put(Vec::with_capacity(64));
        }
        assert_eq!(pool.stats().idle, 2);
    }
}
