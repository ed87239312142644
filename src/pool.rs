//! Free-list of reusable [`PendingBuffer`]s.
//!
//! Metric workers take a fresh buffer after every flush and writers give it back once the
//! results are reported, so steady-state ingestion does not allocate batch storage.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use crate::buffer::PendingBuffer;

/// Default number of idle buffers kept on the free list.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Bounded, lock-free pool of pending buffers.
///
/// When the free list is empty a new buffer is allocated; when it is full a returned
/// buffer is simply dropped.
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<PendingBuffer>,
    stats: PoolStats,
}

/// Counters describing pool effectiveness.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub returns: AtomicU64,
    pub drops: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub returns: u64,
    pub drops: u64,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        BufferPool {
            free: ArrayQueue::new(capacity.max(1)),
            stats: PoolStats::default(),
        }
    }

    /// Takes a cleared buffer from the free list, allocating if none is idle.
    pub fn get(&self) -> PendingBuffer {
        match self.free.pop() {
            Some(buffer) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                PendingBuffer::default()
            }
        }
    }

    /// Returns a buffer to the free list, clearing it first.
    pub fn put(&self, mut buffer: PendingBuffer) {
        buffer.recycle();
        match self.free.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_full) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            returns: self.stats.returns.load(Ordering::Relaxed),
            drops: self.stats.drops.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}
