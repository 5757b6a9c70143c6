//! Node handles and the address layout of the three-level tree.
//!
//! Storage is split across pools:
//! - root: a fixed table of mid-block handles, always present
//! - mid-block: one chunk of leaf-block handles
//! - leaf-block: one chunk holding the list header, the leaf key and the
//!   dense scalar cells

use super::coord::Coord;
use super::error::GridError;

/// Sentinel value for "no node here".
pub const NIL: u32 = u32::MAX;

/// Marker for a slot whose node is being materialized by another worker.
pub const PENDING: u32 = u32::MAX - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkIdx(pub u32);

impl ChunkIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Word offsets inside a leaf-block chunk.
pub(crate) const LEAF_LEN: usize = 0;
pub(crate) const LEAF_HEAD: usize = 1;
pub(crate) const LEAF_TAIL: usize = 2;
pub(crate) const LEAF_KEY: usize = 3;
pub(crate) const LEAF_HEADER_WORDS: usize = 4;

/// Per-axis extents of the three levels.
///
/// Axis 0 is the fastest-varying component of every linear index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout<const D: usize> {
    root: u32,
    mid: u32,
    leaf: u32,
}

/// Where a cell lives in the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Path {
    pub root_slot: usize,
    pub mid_slot: usize,
    pub cell: usize,
    pub leaf_key: u32,
}

impl<const D: usize> Layout<D> {
    pub fn new(root: u32, mid: u32, leaf: u32) -> Result<Self, GridError> {
        if D != 2 && D != 3 {
            return Err(GridError::InvalidConfig(format!(
                "grid dimension must be 2 or 3, got {D}"
            )));
        }
        if root == 0 || mid == 0 || leaf == 0 {
            return Err(GridError::InvalidConfig(format!(
                "level extents must be positive (root={root}, mid={mid}, leaf={leaf})"
            )));
        }
        let domain = root
            .checked_mul(mid)
            .and_then(|n| n.checked_mul(leaf))
            .filter(|&n| n <= i32::MAX as u32)
            .ok_or_else(|| {
                GridError::InvalidConfig(format!(
                    "domain of {root}x{mid}x{leaf} cells per axis overflows i32"
                ))
            })?;
        let leaf_keys = (root * mid)
            .checked_pow(D as u32)
            .filter(|&n| n < PENDING)
            .ok_or_else(|| {
                GridError::InvalidConfig(format!(
                    "{} leaf blocks per axis do not fit a 32-bit key in {D} dimensions",
                    root * mid
                ))
            })?;
        debug_assert!(domain > 0 && leaf_keys > 0);
        leaf.checked_pow(D as u32).ok_or_else(|| {
            GridError::InvalidConfig(format!("leaf extent {leaf} is too large"))
        })?;
        Ok(Self { root, mid, leaf })
    }

    #[inline]
    pub fn root_extent(&self) -> u32 {
        self.root
    }

    #[inline]
    pub fn mid_extent(&self) -> u32 {
        self.mid
    }

    #[inline]
    pub fn leaf_extent(&self) -> u32 {
        self.leaf
    }

    /// Cells per axis in the logical domain.
    #[inline]
    pub fn domain(&self) -> u32 {
        self.root * self.mid * self.leaf
    }

    #[inline]
    pub fn root_slots(&self) -> usize {
        (self.root as usize).pow(D as u32)
    }

    #[inline]
    pub fn mid_slots(&self) -> usize {
        (self.mid as usize).pow(D as u32)
    }

    #[inline]
    pub fn leaf_cells(&self) -> usize {
        (self.leaf as usize).pow(D as u32)
    }

    /// Upper bound on the number of leaf blocks the domain can hold.
    #[inline]
    pub fn leaf_keys(&self) -> u32 {
        (self.root * self.mid).pow(D as u32)
    }

    #[inline]
    pub fn leaf_chunk_words(&self) -> usize {
        LEAF_HEADER_WORDS + self.leaf_cells()
    }

    pub(crate) fn path(&self, coord: Coord<D>) -> Result<Path, GridError> {
        let domain = self.domain();
        let leaves_per_axis = self.root * self.mid;
        let mut root_slot = 0usize;
        let mut mid_slot = 0usize;
        let mut cell = 0usize;
        let mut leaf_key = 0u32;
        let mut root_stride = 1usize;
        let mut mid_stride = 1usize;
        let mut cell_stride = 1usize;
        let mut key_stride = 1u32;

        for &c in coord.0.iter() {
            if c < 0 || c as u32 >= domain {
                return Err(GridError::OutOfDomain {
                    coord: coord.0.to_vec(),
                    extent: domain,
                });
            }
            let c = c as u32;
            let leaf_axis = c / self.leaf;
            cell += (c % self.leaf) as usize * cell_stride;
            mid_slot += (leaf_axis % self.mid) as usize * mid_stride;
            root_slot += (leaf_axis / self.mid) as usize * root_stride;
            leaf_key += leaf_axis * key_stride;

            cell_stride *= self.leaf as usize;
            mid_stride *= self.mid as usize;
            root_stride *= self.root as usize;
            key_stride = key_stride.wrapping_mul(leaves_per_axis);
        }

        Ok(Path {
            root_slot,
            mid_slot,
            cell,
            leaf_key,
        })
    }

    /// First cell coordinate covered by the leaf block with `key`.
    pub fn leaf_origin(&self, key: u32) -> Coord<D> {
        let leaves_per_axis = self.root * self.mid;
        let mut rest = key;
        let mut origin = [0i32; D];
        for axis in origin.iter_mut() {
            *axis = ((rest % leaves_per_axis) * self.leaf) as i32;
            rest /= leaves_per_axis;
        }
        Coord(origin)
    }

    /// Cell coordinate of local cell `local` inside the leaf with `key`.
    pub fn cell_coord(&self, key: u32, local: usize) -> Coord<D> {
        let mut origin = self.leaf_origin(key).0;
        let mut rest = local;
        for axis in origin.iter_mut() {
            *axis += (rest % self.leaf as usize) as i32;
            rest /= self.leaf as usize;
        }
        Coord(origin)
    }
}
