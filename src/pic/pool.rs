//! Fixed-size chunk pool with a lock-free free list.
//!
//! Chunks are carved from backing segments that grow geometrically: segment
//! `k` holds `MIN_SEGMENT_CHUNKS << k` chunks. Segments are never handed back
//! to the system allocator while the pool lives; released chunks go onto a
//! Treiber stack whose head packs an ABA tag with the chunk index. The link
//! of a free chunk is stored in its own word 0.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::error::GridError;
use super::node::{ChunkIdx, NIL, PENDING};

const MIN_SEGMENT_CHUNKS: u32 = 16;
const MAX_SEGMENTS: usize = 32;
const EMPTY_HEAD: u64 = NIL as u64;

/// Snapshot of pool occupancy. Exact when no worker is inside the pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Chunks carved from backing memory so far (free + in use).
    pub backed: u32,
    pub in_use: u32,
    pub free: u32,
    /// Backing segments requested from the system allocator.
    pub segments: usize,
    pub backed_bytes: usize,
}

pub struct ChunkPool {
    name: &'static str,
    chunk_words: usize,
    max_chunks: u32,
    segments: [OnceLock<Box<[AtomicU32]>>; MAX_SEGMENTS],
    /// `(tag << 32) | chunk`, `chunk == NIL` when the stack is empty.
    free_head: AtomicU64,
    carved: AtomicU32,
    in_use: AtomicU32,
    free_len: AtomicU32,
}

/// Segment and chunk offset of a chunk index.
#[inline(always)]
fn segment_of(idx: u32) -> (usize, usize) {
    let q = idx as u64 / MIN_SEGMENT_CHUNKS as u64 + 1;
    let k = q.ilog2() as usize;
    (k, (idx as u64 - segment_start(k)) as usize)
}

#[inline(always)]
fn segment_start(k: usize) -> u64 {
    MIN_SEGMENT_CHUNKS as u64 * ((1u64 << k) - 1)
}

impl ChunkPool {
    /// Create an empty pool. No memory is backed until the first acquire.
    pub fn new(name: &'static str, chunk_words: usize, max_chunks: u32) -> Self {
        assert!(chunk_words > 0, "chunk pool `{name}` needs at least one word per chunk");
        Self {
            name,
            chunk_words,
            // Handles must never collide with the slot sentinels.
            max_chunks: max_chunks.min(PENDING),
            segments: std::array::from_fn(|_| OnceLock::new()),
            free_head: AtomicU64::new(EMPTY_HEAD),
            carved: AtomicU32::new(0),
            in_use: AtomicU32::new(0),
            free_len: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn chunk_words(&self) -> usize {
        self.chunk_words
    }

    #[inline]
    pub fn max_chunks(&self) -> u32 {
        self.max_chunks
    }

    /// Words of a chunk previously returned by `acquire`.
    #[inline(always)]
    pub fn chunk(&self, idx: ChunkIdx) -> &[AtomicU32] {
        let (k, offset) = segment_of(idx.0);
        let segment = self.segments[k]
            .get()
            .expect("chunk handle points into a segment that was never backed");
        let start = offset * self.chunk_words;
        &segment[start..start + self.chunk_words]
    }

    /// Take a chunk, preferring recycled ones. Contents are left as the
    /// previous owner wrote them.
    #[inline]
    pub fn acquire(&self) -> Result<ChunkIdx, GridError> {
        let idx = match self.pop_free() {
            Some(idx) => idx,
            None => self.carve()?,
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(idx)
    }

    /// Take a chunk and set every word to `fill`.
    #[inline]
    pub fn acquire_filled(&self, fill: u32) -> Result<ChunkIdx, GridError> {
        let idx = self.acquire()?;
        for word in self.chunk(idx) {
            word.store(fill, Ordering::Relaxed);
        }
        Ok(idx)
    }

    /// Return a chunk to the free list. The caller must own `idx` and must
    /// not touch it afterwards.
    #[inline]
    pub fn release(&self, idx: ChunkIdx) {
        debug_assert!(idx.0 < self.carved.load(Ordering::Relaxed));
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        // Count before publishing so `free_len` never underflows.
        self.free_len.fetch_add(1, Ordering::Relaxed);

        let link = &self.chunk(idx)[0];
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            link.store(head as u32, Ordering::Relaxed);
            let next = ((head >> 32).wrapping_add(1) << 32) | idx.0 as u64;
            match self
                .free_head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let segments = self.segments.iter().filter(|s| s.get().is_some()).count();
        let backed_bytes = self
            .segments
            .iter()
            .filter_map(|s| s.get())
            .map(|s| s.len() * std::mem::size_of::<AtomicU32>())
            .sum();
        PoolStats {
            backed: self.carved.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            free: self.free_len.load(Ordering::Relaxed),
            segments,
            backed_bytes,
        }
    }

    #[inline]
    fn pop_free(&self) -> Option<ChunkIdx> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let idx = head as u32;
            if idx == NIL {
                return None;
            }
            // The link may be stale if another worker popped `idx` first;
            // the tag makes the exchange below fail in that case.
            let link = self.chunk(ChunkIdx(idx))[0].load(Ordering::Relaxed);
            let next = ((head >> 32).wrapping_add(1) << 32) | link as u64;
            match self
                .free_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.free_len.fetch_sub(1, Ordering::Relaxed);
                    return Some(ChunkIdx(idx));
                }
                Err(actual) => head = actual,
            }
        }
    }

    #[inline]
    fn carve(&self) -> Result<ChunkIdx, GridError> {
        let max = self.max_chunks;
        let idx = self
            .carved
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| GridError::AllocatorExhausted {
                pool: self.name,
                max_chunks: max,
            })?;
        let (k, _) = segment_of(idx);
        self.back_segment(k);
        Ok(ChunkIdx(idx))
    }

    #[cold]
    fn back_segment_slow(&self, k: usize) -> Box<[AtomicU32]> {
        let start = segment_start(k);
        let chunks = ((MIN_SEGMENT_CHUNKS as u64) << k).min(self.max_chunks as u64 - start);
        let words = chunks as usize * self.chunk_words;
        log::debug!(
            "pool `{}`: backing segment {k} with {chunks} chunks ({} KiB)",
            self.name,
            words * std::mem::size_of::<AtomicU32>() / 1024
        );
        (0..words).map(|_| AtomicU32::new(0)).collect()
    }

    #[inline(always)]
    fn back_segment(&self, k: usize) {
        self.segments[k].get_or_init(|| self.back_segment_slow(k));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    use rayon::prelude::*;

    use super::{ChunkPool, MIN_SEGMENT_CHUNKS, segment_of};
    use crate::pic::error::GridError;
    use crate::pic::node::ChunkIdx;

    #[test]
    fn segments_double_in_size() {
        assert_eq!(segment_of(0), (0, 0));
        assert_eq!(segment_of(MIN_SEGMENT_CHUNKS - 1), (0, 15));
        assert_eq!(segment_of(16), (1, 0));
        assert_eq!(segment_of(47), (1, 31));
        assert_eq!(segment_of(48), (2, 0));
        assert_eq!(segment_of(u32::MAX - 2).0, 28);
    }

    #[test]
    fn released_chunk_is_reused_before_carving() {
        let pool = ChunkPool::new("test", 4, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        pool.release(a);

        let c = pool.acquire().unwrap();
        assert_eq!(c, a);
        let stats = pool.stats();
        assert_eq!(stats.backed, 2);
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.free, 0);
        assert_eq!(stats.segments, 1);
    }

    #[test]
    fn acquire_filled_overwrites_previous_contents() {
        let pool = ChunkPool::new("test", 8, 4);
        let a = pool.acquire().unwrap();
        for word in pool.chunk(a) {
            word.store(5, Ordering::Relaxed);
        }
        pool.release(a);
        let b = pool.acquire_filled(0).unwrap();
        assert_eq!(a, b);
        assert!(pool.chunk(b).iter().all(|w| w.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn exhaustion_is_reported_and_recoverable_by_release() {
        let pool = ChunkPool::new("tiny", 2, 3);
        let held: Vec<ChunkIdx> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(
            pool.acquire(),
            Err(GridError::AllocatorExhausted {
                pool: "tiny",
                max_chunks: 3
            })
        );
        pool.release(held[1]);
        assert_eq!(pool.acquire(), Ok(held[1]));
        assert_eq!(pool.stats().backed, 3);
    }

    #[test]
    fn growth_spans_segments_without_moving_chunks() {
        let pool = ChunkPool::new("grow", 3, 1 << 10);
        let held: Vec<ChunkIdx> = (0..100).map(|_| pool.acquire().unwrap()).collect();
        for (i, &idx) in held.iter().enumerate() {
            pool.chunk(idx)[2].store(i as u32, Ordering::Relaxed);
        }
        for (i, &idx) in held.iter().enumerate() {
            assert_eq!(pool.chunk(idx)[2].load(Ordering::Relaxed), i as u32);
        }
        // 16 + 32 + 64 chunks cover the first 100.
        assert_eq!(pool.stats().segments, 3);
    }

    #[test]
    fn concurrent_acquire_release_never_hands_out_a_chunk_twice() {
        const ROUNDS: usize = 200;
        const HELD: usize = 8;
        let pool = ChunkPool::new("stress", 2, 1 << 16);

        (0..16u32).into_par_iter().for_each(|worker| {
            let mut held = Vec::with_capacity(HELD);
            for round in 0..ROUNDS {
                for _ in 0..HELD {
                    let idx = pool.acquire().unwrap();
                    pool.chunk(idx)[1].store(worker, Ordering::Relaxed);
                    held.push(idx);
                }
                for &idx in &held {
                    assert_eq!(
                        pool.chunk(idx)[1].load(Ordering::Relaxed),
                        worker,
                        "chunk {idx:?} shared between workers in round {round}"
                    );
                }
                for idx in held.drain(..) {
                    pool.release(idx);
                }
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free, stats.backed);
        assert!(stats.backed as usize <= 16 * HELD);

        let mut seen = HashSet::new();
        let drained: Vec<ChunkIdx> = (0..stats.backed).map(|_| pool.acquire().unwrap()).collect();
        for idx in &drained {
            assert!(seen.insert(*idx), "free list contains {idx:?} twice");
        }
        assert_eq!(pool.stats().backed, stats.backed);
    }
}
