//! Sparse three-level spatial index of particle ids for particle-in-cell
//! simulations.

pub mod pic;
pub use pic::{
    Coord, GridError, ParticleIndex, ParticleIndexConfig, ParticleSource, ParticleStore,
    SparseGrid,
};
