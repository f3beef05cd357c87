//! Bounded, size-classed buffer reuse for the forwarding hot path.
//!
//! One size class covers ordinary RTP (2 KiB, comfortably above any LAN MTU).
//! Larger requests fall through to a fresh allocation that is not retained.
//! Shards keep the free lists out of each other's way; a buffer returns to
//! its pool on drop, after all subscriber writes completed.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Standard slab size. Requests above this are served unpooled.
pub const SLAB_SIZE: usize = 2048;

const SHARDS: usize = 4;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Acquisitions served from a free list
    pub hits: u64,
    /// Acquisitions that had to allocate a fresh slab
    pub misses: u64,
    /// Requests above `SLAB_SIZE`, served unpooled
    pub oversize: u64,
}

pub struct BufferPool {
    shards: [Mutex<Vec<Vec<u8>>>; SHARDS],
    /// Round-robin cursor so concurrent lanes spread across shards
    cursor: AtomicUsize,
    per_shard_cap: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    oversize: AtomicU64,
}

impl BufferPool {
    /// `retained` bounds the total number of idle slabs kept across shards.
    pub fn new(retained: usize) -> Arc<Self> {
        Arc::new(Self {
            shards: std::array::from_fn(|_| Mutex::new(Vec::new())),
            cursor: AtomicUsize::new(0),
            per_shard_cap: retained.div_ceil(SHARDS).max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            oversize: AtomicU64::new(0),
        })
    }

    /// Get a buffer of exactly `len` bytes (contents unspecified).
    pub fn acquire(self: &Arc<Self>, len: usize) -> PooledBuf {
        if len > SLAB_SIZE {
            self.oversize.fetch_add(1, Ordering::Relaxed);
            return PooledBuf {
                buf: vec![0u8; len],
                pool: None,
            };
        }

        let shard = self.cursor.fetch_add(1, Ordering::Relaxed) % SHARDS;
        let reused = self.shards[shard].lock().unwrap().pop();
        let mut buf = match reused {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(SLAB_SIZE)
            }
        };
        buf.resize(len, 0);
        PooledBuf {
            buf,
            pool: Some(self.clone()),
        }
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let shard = self.cursor.fetch_add(1, Ordering::Relaxed) % SHARDS;
        let mut free = self.shards[shard].lock().unwrap();
        if free.len() < self.per_shard_cap {
            free.push(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
        }
    }

    /// Idle slabs currently retained.
    pub fn idle(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }
}

/// A buffer checked out of a [`BufferPool`]; returns on drop. Oversize
/// buffers carry no pool reference and are simply freed.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Option<Arc<BufferPool>>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.buf));
        }
    }
}
