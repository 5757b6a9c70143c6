//! Sparse three-level grid: root table, mid-blocks, leaf-blocks.
//!
//! Every level is materialized on first touch through the claim protocol.
//! Activated mid-blocks and leaf-blocks are recorded in registries (dynamic
//! lists over a dedicated pool), so deactivation walks only what was
//! activated since the last reset.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};

use super::coord::Coord;
use super::dispatch::{Dispatch, SerialDispatch};
use super::error::GridError;
use super::list::{DynamicList, LIST_CHUNK_OVERHEAD, ListHead};
use super::node::{
    ChunkIdx, LEAF_HEAD, LEAF_HEADER_WORDS, LEAF_KEY, LEAF_LEN, LEAF_TAIL, Layout, NIL, Path,
};
use super::pool::{ChunkPool, PoolStats};
use super::sync::{Claim, atomic_add_f32, claim_or_follow, follow};

/// Values per registry chunk.
const REGISTRY_CHUNK_VALUES: usize = 1023;

/// Leaves released per group when deactivating through a dispatch.
const RELEASE_GROUP: usize = 64;

/// Occupancy of every pool behind a grid, plus active node counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GridStats {
    pub mids: PoolStats,
    pub leaves: PoolStats,
    pub lists: PoolStats,
    pub registry: PoolStats,
    pub active_mids: u32,
    pub active_leaves: u32,
}

impl GridStats {
    /// Chunks carved across all pools. Stable across steps once the working
    /// set has been reached.
    pub fn total_backed(&self) -> u64 {
        [self.mids, self.leaves, self.lists, self.registry]
            .iter()
            .map(|s| s.backed as u64)
            .sum()
    }

    pub fn total_in_use(&self) -> u64 {
        [self.mids, self.leaves, self.lists, self.registry]
            .iter()
            .map(|s| s.in_use as u64)
            .sum()
    }

    pub fn backed_bytes(&self) -> usize {
        self.mids.backed_bytes
            + self.leaves.backed_bytes
            + self.lists.backed_bytes
            + self.registry.backed_bytes
    }
}

pub struct SparseGrid<const D: usize> {
    layout: Layout<D>,
    root: Box<[AtomicU32]>,
    mids: ChunkPool,
    leaves: ChunkPool,
    lists: ChunkPool,
    registry: ChunkPool,
    /// Root slots that hold a mid-block.
    mid_registry: ListHead,
    /// Handles of active leaf-blocks.
    leaf_registry: ListHead,
    leaf_list_capacity: u32,
    release_scratch: Vec<u32>,
}

impl<const D: usize> SparseGrid<D> {
    /// Create an empty grid.
    ///
    /// Each leaf list holds at most `leaf_list_capacity` ids in chunks of
    /// `chunk_size` values; the list pool never backs more than
    /// `max_list_chunks` chunks.
    pub fn new(
        layout: Layout<D>,
        leaf_list_capacity: u32,
        chunk_size: u32,
        max_list_chunks: u32,
    ) -> Result<Self, GridError> {
        if leaf_list_capacity == 0 {
            return Err(GridError::InvalidConfig(
                "leaf list capacity must be positive".into(),
            ));
        }
        if chunk_size == 0 || chunk_size >= u32::MAX / 2 {
            return Err(GridError::InvalidConfig(format!(
                "chunk size {chunk_size} is out of range"
            )));
        }
        if max_list_chunks == 0 {
            return Err(GridError::InvalidConfig(
                "memory budget leaves no room for a single list chunk".into(),
            ));
        }

        let root_slots = layout.root_slots();
        let leaf_keys = layout.leaf_keys();
        let registry_chunks = (leaf_keys as usize).div_ceil(REGISTRY_CHUNK_VALUES)
            + root_slots.div_ceil(REGISTRY_CHUNK_VALUES);

        Ok(Self {
            layout,
            root: (0..root_slots).map(|_| AtomicU32::new(NIL)).collect(),
            mids: ChunkPool::new("mid", layout.mid_slots(), root_slots as u32),
            leaves: ChunkPool::new("leaf", layout.leaf_chunk_words(), leaf_keys),
            lists: ChunkPool::new(
                "list",
                LIST_CHUNK_OVERHEAD + chunk_size as usize,
                max_list_chunks,
            ),
            registry: ChunkPool::new(
                "registry",
                LIST_CHUNK_OVERHEAD + REGISTRY_CHUNK_VALUES,
                registry_chunks as u32,
            ),
            mid_registry: ListHead::new(),
            leaf_registry: ListHead::new(),
            leaf_list_capacity,
            release_scratch: Vec::new(),
        })
    }

    #[inline]
    pub fn layout(&self) -> &Layout<D> {
        &self.layout
    }

    #[inline]
    pub fn leaf_list_capacity(&self) -> u32 {
        self.leaf_list_capacity
    }

    #[inline]
    fn mid_registry(&self) -> DynamicList<'_> {
        self.mid_registry
            .bind(&self.registry, self.layout.root_slots() as u32)
    }

    #[inline]
    fn leaf_registry(&self) -> DynamicList<'_> {
        self.leaf_registry.bind(&self.registry, self.layout.leaf_keys())
    }

    #[inline]
    fn leaf(&self, handle: u32) -> LeafBlock<'_, D> {
        LeafBlock {
            grid: self,
            handle: ChunkIdx(handle),
        }
    }

    /// Make sure the root slot → mid-block → leaf-block path for `coord`
    /// exists and return its leaf.
    #[inline]
    pub fn activate_path(&self, coord: Coord<D>) -> Result<LeafBlock<'_, D>, GridError> {
        let path = self.layout.path(coord)?;
        self.activate(&path)
    }

    fn activate(&self, path: &Path) -> Result<LeafBlock<'_, D>, GridError> {
        let mid = match claim_or_follow(&self.root[path.root_slot], || {
            Ok(self.mids.acquire_filled(NIL)?.0)
        })? {
            Claim::Created(handle) => {
                self.mid_registry().append(path.root_slot as u32)?;
                handle
            }
            Claim::Existing(handle) => handle,
        };

        let slot = &self.mids.chunk(ChunkIdx(mid))[path.mid_slot];
        let leaf = match claim_or_follow(slot, || self.new_leaf(path.leaf_key))? {
            Claim::Created(handle) => {
                self.leaf_registry().append(handle)?;
                handle
            }
            Claim::Existing(handle) => handle,
        };
        Ok(self.leaf(leaf))
    }

    fn new_leaf(&self, key: u32) -> Result<u32, GridError> {
        let idx = self.leaves.acquire()?;
        let words = self.leaves.chunk(idx);
        words[LEAF_LEN].store(0, Ordering::Relaxed);
        words[LEAF_HEAD].store(NIL, Ordering::Relaxed);
        words[LEAF_TAIL].store(NIL, Ordering::Relaxed);
        words[LEAF_KEY].store(key, Ordering::Relaxed);
        for cell in &words[LEAF_HEADER_WORDS..] {
            cell.store(0f32.to_bits(), Ordering::Relaxed);
        }
        Ok(idx.0)
    }

    /// Leaf covering `coord`, if its path is active. Out-of-domain
    /// coordinates are never active.
    #[inline]
    pub fn leaf_for(&self, coord: Coord<D>) -> Option<LeafBlock<'_, D>> {
        let path = self.layout.path(coord).ok()?;
        self.lookup(&path)
    }

    fn lookup(&self, path: &Path) -> Option<LeafBlock<'_, D>> {
        let mid = follow(&self.root[path.root_slot])?;
        let leaf = follow(&self.mids.chunk(ChunkIdx(mid))[path.mid_slot])?;
        Some(self.leaf(leaf))
    }

    /// Add `value` to the scalar cell at `coord`, activating its path.
    pub fn accumulate(&self, coord: Coord<D>, value: f32) -> Result<(), GridError> {
        let path = self.layout.path(coord)?;
        let leaf = self.activate(&path)?;
        atomic_add_f32(&leaf.words()[LEAF_HEADER_WORDS + path.cell], value);
        Ok(())
    }

    /// Scalar value at `coord`; zero when the cell is inactive.
    pub fn value_at(&self, coord: Coord<D>) -> f32 {
        let Ok(path) = self.layout.path(coord) else {
            return 0.0;
        };
        self.lookup(&path).map_or(0.0, |leaf| leaf.cell(path.cell))
    }

    #[inline]
    pub fn active_leaf_count(&self) -> u32 {
        self.leaf_registry().len()
    }

    #[inline]
    pub fn active_mid_count(&self) -> u32 {
        self.mid_registry().len()
    }

    /// Active leaves in activation order. Restartable.
    pub fn active_leaves(&self) -> impl Iterator<Item = LeafBlock<'_, D>> + '_ {
        self.leaf_registry().iter().map(move |handle| self.leaf(handle))
    }

    pub fn for_each_active_leaf<F: FnMut(LeafBlock<'_, D>)>(&self, visit: F) {
        self.active_leaves().for_each(visit);
    }

    /// Release every active node and list chunk back to the pools.
    pub fn deactivate_all(&mut self) {
        self.deactivate_all_in(&SerialDispatch);
    }

    /// Same as [`deactivate_all`](Self::deactivate_all), releasing leaves in
    /// parallel through `dispatch`.
    pub fn deactivate_all_in<X: Dispatch>(&mut self, dispatch: &X) {
        let mut scratch = std::mem::take(&mut self.release_scratch);
        scratch.clear();
        scratch.extend(self.leaf_registry().iter());

        let this = &*self;
        let released = dispatch.dispatch::<Infallible, _>(scratch.len(), RELEASE_GROUP, |range| {
            for &handle in &scratch[range] {
                this.release_leaf(handle);
            }
            Ok(())
        });
        if let Err(never) = released {
            match never {}
        }

        for slot in self.mid_registry().iter() {
            let mid = self.root[slot as usize].swap(NIL, Ordering::AcqRel);
            if mid != NIL {
                self.mids.release(ChunkIdx(mid));
            }
        }
        self.leaf_registry().clear();
        self.mid_registry().clear();
        self.release_scratch = scratch;
    }

    fn release_leaf(&self, handle: u32) {
        let leaf = self.leaf(handle);
        leaf.particles().clear();
        self.leaves.release(ChunkIdx(handle));
    }

    pub fn stats(&self) -> GridStats {
        GridStats {
            mids: self.mids.stats(),
            leaves: self.leaves.stats(),
            lists: self.lists.stats(),
            registry: self.registry.stats(),
            active_mids: self.active_mid_count(),
            active_leaves: self.active_leaf_count(),
        }
    }
}

/// View of an active leaf-block.
#[derive(Clone, Copy)]
pub struct LeafBlock<'a, const D: usize> {
    grid: &'a SparseGrid<D>,
    handle: ChunkIdx,
}

impl<'a, const D: usize> LeafBlock<'a, D> {
    #[inline(always)]
    fn words(&self) -> &'a [AtomicU32] {
        self.grid.leaves.chunk(self.handle)
    }

    #[inline]
    pub fn handle(&self) -> ChunkIdx {
        self.handle
    }

    /// Linear leaf index, axis 0 fastest.
    #[inline]
    pub fn key(&self) -> u32 {
        self.words()[LEAF_KEY].load(Ordering::Relaxed)
    }

    pub fn origin(&self) -> Coord<D> {
        self.grid.layout.leaf_origin(self.key())
    }

    /// Particle ids appended to this leaf.
    #[inline]
    pub fn particles(&self) -> DynamicList<'a> {
        let words = self.words();
        DynamicList::from_words(
            &words[LEAF_LEN],
            &words[LEAF_HEAD],
            &words[LEAF_TAIL],
            &self.grid.lists,
            self.grid.leaf_list_capacity,
        )
    }

    /// Scalar value of local cell `local` (axis 0 fastest).
    #[inline]
    pub fn cell(&self, local: usize) -> f32 {
        f32::from_bits(self.words()[LEAF_HEADER_WORDS + local].load(Ordering::Acquire))
    }

    #[inline]
    pub fn add_to_cell(&self, local: usize, value: f32) {
        atomic_add_f32(&self.words()[LEAF_HEADER_WORDS + local], value);
    }

    /// Non-zero cells with their global coordinates.
    pub fn cells(&self) -> impl Iterator<Item = (Coord<D>, f32)> + 'a {
        let layout = self.grid.layout;
        let key = self.key();
        self.words()[LEAF_HEADER_WORDS..]
            .iter()
            .enumerate()
            .map(|(local, word)| (local, f32::from_bits(word.load(Ordering::Acquire))))
            .filter(|&(_, value)| value != 0.0)
            .map(move |(local, value)| (layout.cell_coord(key, local), value))
    }
}

impl<const D: usize> std::fmt::Debug for LeafBlock<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafBlock")
            .field("handle", &self.handle)
            .field("origin", &self.origin())
            .field("particles", &self.particles().len())
            .finish()
    }
}
