//! Particle positions as seen by the rebuild pass.

use super::error::GridError;

/// Default maximum number of particles a [`ParticleStore`] accepts.
pub const DEFAULT_STORE_CEILING: usize = 1 << 25;

/// Default number of positions per store chunk.
pub const DEFAULT_STORE_CHUNK: usize = 1 << 20;

/// Read-only access to particle positions, indexed `0..len()`.
///
/// The index of a particle is the id appended to its leaf list.
pub trait ParticleSource<const D: usize>: Sync {
    fn len(&self) -> usize;

    fn position(&self, index: usize) -> [f32; D];

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const D: usize> ParticleSource<D> for [[f32; D]] {
    #[inline]
    fn len(&self) -> usize {
        <[[f32; D]]>::len(self)
    }

    #[inline]
    fn position(&self, index: usize) -> [f32; D] {
        self[index]
    }
}

impl<const D: usize> ParticleSource<D> for Vec<[f32; D]> {
    #[inline]
    fn len(&self) -> usize {
        Vec::len(self)
    }

    #[inline]
    fn position(&self, index: usize) -> [f32; D] {
        self[index]
    }
}

/// Chunked growable list of positions with a fixed ceiling.
///
/// Growth never moves stored positions: a full chunk stays where it is and a
/// new one is allocated.
#[derive(Clone, Debug)]
pub struct ParticleStore<const D: usize> {
    chunks: Vec<Vec<[f32; D]>>,
    chunk_len: usize,
    ceiling: usize,
    len: usize,
}

impl<const D: usize> Default for ParticleStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: usize> ParticleStore<D> {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_STORE_CEILING, DEFAULT_STORE_CHUNK)
    }

    /// Store holding at most `ceiling` particles, allocated `chunk_len` at a
    /// time. Ids are `u32`, so the ceiling is clamped to `u32::MAX`.
    pub fn with_limits(ceiling: usize, chunk_len: usize) -> Self {
        Self {
            chunks: Vec::new(),
            chunk_len: chunk_len.max(1),
            ceiling: ceiling.min(u32::MAX as usize),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Append a particle and return its id.
    pub fn push(&mut self, position: [f32; D]) -> Result<u32, GridError> {
        if self.len >= self.ceiling {
            return Err(GridError::StoreFull {
                ceiling: self.ceiling,
            });
        }
        let needs_chunk = self
            .chunks
            .last()
            .is_none_or(|chunk| chunk.len() == self.chunk_len);
        if needs_chunk {
            self.chunks.push(Vec::with_capacity(self.chunk_len));
        }
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.push(position);
        }
        let id = self.len as u32;
        self.len += 1;
        Ok(id)
    }

    /// Append every position, stopping at the first failure.
    pub fn extend_from<I>(&mut self, positions: I) -> Result<(), GridError>
    where
        I: IntoIterator<Item = [f32; D]>,
    {
        for position in positions {
            self.push(position)?;
        }
        Ok(())
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<[f32; D]> {
        if index >= self.len {
            return None;
        }
        Some(self.chunks[index / self.chunk_len][index % self.chunk_len])
    }

    /// Overwrite the position of an existing particle.
    #[inline]
    pub fn set(&mut self, index: usize, position: [f32; D]) -> Option<()> {
        if index >= self.len {
            return None;
        }
        self.chunks[index / self.chunk_len][index % self.chunk_len] = position;
        Some(())
    }

    pub fn iter(&self) -> impl Iterator<Item = [f32; D]> + '_ {
        self.chunks.iter().flatten().copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut [f32; D]> + '_ {
        self.chunks.iter_mut().flatten()
    }

    /// Drop every particle, keeping the first chunk's allocation.
    pub fn clear(&mut self) {
        self.chunks.truncate(1);
        if let Some(first) = self.chunks.first_mut() {
            first.clear();
        }
        self.len = 0;
    }
}

impl<const D: usize> ParticleSource<D> for ParticleStore<D> {
    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn position(&self, index: usize) -> [f32; D] {
        self.chunks[index / self.chunk_len][index % self.chunk_len]
    }
}

#[cfg(test)]
mod tests {
    use super::{ParticleSource, ParticleStore};
    use crate::pic::error::GridError;

    #[test]
    fn ids_are_dense_across_chunks() {
        let mut store = ParticleStore::<2>::with_limits(100, 4);
        for i in 0..10 {
            assert_eq!(store.push([i as f32, 0.5]), Ok(i));
        }
        assert_eq!(store.len(), 10);
        assert_eq!(store.get(9), Some([9.0, 0.5]));
        assert_eq!(store.get(10), None);
        assert_eq!(ParticleSource::position(&store, 5), [5.0, 0.5]);
        assert_eq!(store.iter().count(), 10);
    }

    #[test]
    fn ceiling_is_enforced() {
        let mut store = ParticleStore::<3>::with_limits(3, 2);
        store.extend_from([[0.0; 3]; 3]).unwrap();
        assert_eq!(
            store.push([1.0; 3]),
            Err(GridError::StoreFull { ceiling: 3 })
        );
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn set_and_clear() {
        let mut store = ParticleStore::<2>::with_limits(8, 2);
        store.extend_from([[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]).unwrap();
        store.set(2, [0.25, 0.75]).unwrap();
        assert_eq!(store.get(2), Some([0.25, 0.75]));
        assert_eq!(store.set(3, [0.0, 0.0]), None);
        for p in store.iter_mut() {
            p[0] += 1.0;
        }
        assert_eq!(store.get(0), Some([1.0, 0.0]));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.push([4.0, 4.0]), Ok(0));
        assert_eq!(store.get(0), Some([4.0, 4.0]));
    }

    #[test]
    fn slices_and_vectors_are_sources() {
        let positions = vec![[0.1f32, 0.2], [0.3, 0.4]];
        assert_eq!(ParticleSource::len(&positions), 2);
        assert_eq!(ParticleSource::position(positions.as_slice(), 1), [0.3, 0.4]);
        let empty: &[[f32; 3]] = &[];
        assert!(ParticleSource::is_empty(empty));
    }
}
