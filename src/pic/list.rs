//! Chunk-backed dynamic append list.
//!
//! A list is three words: a length counter, the handle of its first chunk and
//! the handle of the furthest chunk linked so far. Chunk word 0 links to the
//! next chunk, word 1 holds the chunk's position in the chain, the remaining
//! words hold values. `append` reserves a slot with `fetch_add` on the length,
//! then walks to the slot's chunk starting from the cached tail when the tail
//! is not past it, materializing missing chunks through the claim protocol so
//! each chunk of a chain is allocated exactly once.

use std::sync::atomic::{AtomicU32, Ordering};

use super::error::GridError;
use super::node::{ChunkIdx, NIL, PENDING};
use super::pool::ChunkPool;
use super::sync::claim_or_follow;

const LINK: usize = 0;
const ORDINAL: usize = 1;

/// Words of every list chunk not available for values.
pub const LIST_CHUNK_OVERHEAD: usize = 2;

/// Owned list header, for lists that live outside the grid.
#[derive(Debug)]
pub struct ListHead {
    len: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
}

impl Default for ListHead {
    fn default() -> Self {
        Self::new()
    }
}

impl ListHead {
    pub const fn new() -> Self {
        Self {
            len: AtomicU32::new(0),
            head: AtomicU32::new(NIL),
            tail: AtomicU32::new(NIL),
        }
    }

    /// View this header as a list drawing chunks from `pool`.
    pub fn bind<'a>(&'a self, pool: &'a ChunkPool, capacity: u32) -> DynamicList<'a> {
        DynamicList::from_words(&self.len, &self.head, &self.tail, pool, capacity)
    }
}

/// A dynamic append list borrowed from its header words and pool.
#[derive(Clone, Copy)]
pub struct DynamicList<'a> {
    len: &'a AtomicU32,
    head: &'a AtomicU32,
    tail: &'a AtomicU32,
    pool: &'a ChunkPool,
    capacity: u32,
}

impl<'a> DynamicList<'a> {
    #[inline]
    pub(crate) fn from_words(
        len: &'a AtomicU32,
        head: &'a AtomicU32,
        tail: &'a AtomicU32,
        pool: &'a ChunkPool,
        capacity: u32,
    ) -> Self {
        debug_assert!(
            pool.chunk_words() > LIST_CHUNK_OVERHEAD,
            "list chunks need a link, an ordinal and one value"
        );
        Self {
            len,
            head,
            tail,
            pool,
            capacity,
        }
    }

    #[inline(always)]
    fn per_chunk(&self) -> u32 {
        (self.pool.chunk_words() - LIST_CHUNK_OVERHEAD) as u32
    }

    #[inline(always)]
    fn ordinal(&self, chunk: u32) -> u32 {
        self.pool.chunk(ChunkIdx(chunk))[ORDINAL].load(Ordering::Relaxed)
    }

    /// Append `value` and return the slot it landed in.
    ///
    /// Safe to call from many workers at once; ordering between concurrent
    /// appends is unspecified.
    #[inline]
    pub fn append(&self, value: u32) -> Result<u32, GridError> {
        let slot = self.len.fetch_add(1, Ordering::Relaxed);
        if slot >= self.capacity {
            return Err(GridError::ListFull {
                capacity: self.capacity,
            });
        }

        let pool = self.pool;
        let per_chunk = self.per_chunk();
        let target = slot / per_chunk;

        let tail = self.tail.load(Ordering::Acquire);
        let (mut chunk, mut ordinal) = if tail != NIL && self.ordinal(tail) <= target {
            (tail, self.ordinal(tail))
        } else {
            let first = claim_or_follow(self.head, || Self::new_chunk(pool, 0))?.handle();
            (first, 0)
        };
        while ordinal < target {
            let link = &pool.chunk(ChunkIdx(chunk))[LINK];
            ordinal += 1;
            chunk = claim_or_follow(link, || Self::new_chunk(pool, ordinal))?.handle();
        }
        self.advance_tail(chunk, target);

        let words = pool.chunk(ChunkIdx(chunk));
        words[LIST_CHUNK_OVERHEAD + (slot % per_chunk) as usize].store(value, Ordering::Release);
        Ok(slot)
    }

    /// Point the cached tail at `chunk` unless it already points further.
    #[inline]
    fn advance_tail(&self, chunk: u32, ordinal: u32) {
        let mut current = self.tail.load(Ordering::Acquire);
        loop {
            if current != NIL && self.ordinal(current) >= ordinal {
                return;
            }
            match self.tail.compare_exchange_weak(
                current,
                chunk,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    fn new_chunk(pool: &ChunkPool, ordinal: u32) -> Result<u32, GridError> {
        let idx = pool.acquire()?;
        let words = pool.chunk(idx);
        words[LINK].store(NIL, Ordering::Relaxed);
        words[ORDINAL].store(ordinal, Ordering::Relaxed);
        Ok(idx.0)
    }

    /// Return every chunk to the pool and reset the length.
    ///
    /// Must not overlap with `append` on the same list.
    pub fn clear(&self) {
        self.tail.store(NIL, Ordering::Release);
        let mut next = self.head.swap(NIL, Ordering::AcqRel);
        while next != NIL {
            debug_assert_ne!(next, PENDING, "list cleared while an append was growing it");
            let idx = ChunkIdx(next);
            next = self.pool.chunk(idx)[LINK].load(Ordering::Acquire);
            self.pool.release(idx);
        }
        self.len.store(0, Ordering::Release);
    }

    /// Number of values stored.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len.load(Ordering::Acquire).min(self.capacity)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Chunks currently linked into the list.
    pub fn chunk_count(&self) -> usize {
        let mut count = 0;
        let mut next = self.head.load(Ordering::Acquire);
        while next != NIL && next != PENDING {
            count += 1;
            next = self.pool.chunk(ChunkIdx(next))[LINK].load(Ordering::Acquire);
        }
        count
    }

    /// Values in chunk order, then slot order. Each call starts over.
    pub fn iter(&self) -> ListIter<'a> {
        ListIter {
            pool: self.pool,
            chunk: self.head.load(Ordering::Acquire),
            offset: 0,
            per_chunk: self.per_chunk(),
            remaining: self.len(),
        }
    }

    #[inline]
    pub fn for_each<F: FnMut(u32)>(&self, f: F) {
        self.iter().for_each(f);
    }
}

impl<'a> IntoIterator for DynamicList<'a> {
    type Item = u32;
    type IntoIter = ListIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct ListIter<'a> {
    pool: &'a ChunkPool,
    chunk: u32,
    offset: u32,
    per_chunk: u32,
    remaining: u32,
}

impl Iterator for ListIter<'_> {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        if self.offset == self.per_chunk {
            self.chunk = self.pool.chunk(ChunkIdx(self.chunk))[LINK].load(Ordering::Acquire);
            self.offset = 0;
        }
        if self.chunk == NIL || self.chunk == PENDING {
            self.remaining = 0;
            return None;
        }
        let value = self.pool.chunk(ChunkIdx(self.chunk))
            [LIST_CHUNK_OVERHEAD + self.offset as usize]
            .load(Ordering::Acquire);
        self.offset += 1;
        self.remaining -= 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use rayon::prelude::*;

    use super::{LIST_CHUNK_OVERHEAD, ListHead, NIL, ORDINAL};
    use crate::pic::error::GridError;
    use crate::pic::node::ChunkIdx;
    use crate::pic::pool::ChunkPool;

    fn list_pool(per_chunk: usize, max_chunks: u32) -> ChunkPool {
        ChunkPool::new("list", LIST_CHUNK_OVERHEAD + per_chunk, max_chunks)
    }

    #[test]
    fn values_cross_chunk_boundaries_in_order() {
        let pool = list_pool(4, 64);
        let head = ListHead::new();
        let list = head.bind(&pool, 1_000);

        for v in 0..10u32 {
            assert_eq!(list.append(v * 10), Ok(v));
        }
        assert_eq!(list.len(), 10);
        assert_eq!(list.chunk_count(), 3);
        assert_eq!(list.iter().collect::<Vec<_>>(), (0..10).map(|v| v * 10).collect::<Vec<_>>());
        // Restartable.
        assert_eq!(list.iter().count(), 10);
    }

    #[test]
    fn empty_list_yields_nothing_and_owns_no_chunks() {
        let pool = list_pool(4, 8);
        let head = ListHead::default();
        let list = head.bind(&pool, 16);
        assert!(list.is_empty());
        assert_eq!(list.iter().next(), None);
        assert_eq!(list.chunk_count(), 0);
        assert_eq!(pool.stats().backed, 0);
    }

    #[test]
    fn clear_returns_chunks_and_resets() {
        let pool = list_pool(2, 64);
        let head = ListHead::new();
        let list = head.bind(&pool, 1_000);
        for v in 0..7 {
            list.append(v).unwrap();
        }
        assert_eq!(pool.stats().in_use, 4);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.chunk_count(), 0);
        assert_eq!(head.tail.load(Ordering::Relaxed), NIL);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().free, 4);

        for v in 100..107 {
            list.append(v).unwrap();
        }
        assert_eq!(list.iter().collect::<Vec<_>>(), (100..107).collect::<Vec<_>>());
        assert_eq!(pool.stats().backed, 4, "clear must recycle, not leak");
    }

    #[test]
    fn tail_tracks_the_last_linked_chunk() {
        let pool = list_pool(3, 1 << 10);
        let head = ListHead::new();
        let list = head.bind(&pool, 1 << 20);
        for v in 0..3_000u32 {
            list.append(v).unwrap();
            let tail = head.tail.load(Ordering::Relaxed);
            assert_eq!(
                pool.chunk(ChunkIdx(tail))[ORDINAL].load(Ordering::Relaxed),
                v / 3,
                "tail lags after appending {v}"
            );
        }
        assert_eq!(list.chunk_count(), 1_000);
        assert_eq!(pool.stats().backed, 1_000);
        assert!(list.iter().eq(0..3_000));
    }

    #[test]
    fn appending_past_capacity_fails_without_corrupting_contents() {
        let pool = list_pool(2, 64);
        let head = ListHead::new();
        let list = head.bind(&pool, 4);
        for v in 0..4 {
            list.append(v).unwrap();
        }
        assert_eq!(list.append(99), Err(GridError::ListFull { capacity: 4 }));
        assert_eq!(list.len(), 4);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        list.clear();
        assert_eq!(list.append(5), Ok(0));
    }

    #[test]
    fn exhausted_pool_surfaces_and_leaves_chain_consistent() {
        let pool = list_pool(2, 1);
        let head = ListHead::new();
        let list = head.bind(&pool, 100);
        list.append(1).unwrap();
        list.append(2).unwrap();
        assert!(matches!(
            list.append(3),
            Err(GridError::AllocatorExhausted { .. })
        ));
        assert_eq!(list.chunk_count(), 1);
        assert_eq!(list.iter().take(2).collect::<Vec<_>>(), vec![1, 2]);
        list.clear();
        assert_eq!(head.head.load(Ordering::Relaxed), NIL);
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        const WORKERS: u32 = 8;
        const PER_WORKER: u32 = 20_000;
        let pool = list_pool(256, 1 << 12);
        let head = ListHead::new();
        let list = head.bind(&pool, 1 << 20);

        (0..WORKERS).into_par_iter().for_each(|w| {
            for i in 0..PER_WORKER {
                list.append(w * PER_WORKER + i).unwrap();
            }
        });

        let total = WORKERS * PER_WORKER;
        let mut values: Vec<u32> = list.iter().collect();
        values.sort_unstable();
        assert_eq!(values, (0..total).collect::<Vec<_>>());

        let expected_chunks = total.div_ceil(256) as usize;
        assert_eq!(list.chunk_count(), expected_chunks);
        assert_eq!(pool.stats().backed as usize, expected_chunks);
        let tail = head.tail.load(Ordering::Relaxed);
        assert_eq!(
            pool.chunk(ChunkIdx(tail))[ORDINAL].load(Ordering::Relaxed) as usize,
            expected_chunks - 1
        );
    }
}
