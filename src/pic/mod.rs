//! Sparse particle index internals and public API.

mod coord;
mod dispatch;
mod engine;
mod error;
mod list;
mod node;
mod particles;
mod pool;
mod sync;
mod tree;

pub use coord::Coord;
pub use dispatch::{Dispatch, PoolDispatch, SerialDispatch};
pub use engine::{ParticleIndex, ParticleIndexConfig, Phase, THREADS_ENV};
pub use error::GridError;
pub use list::{DynamicList, LIST_CHUNK_OVERHEAD, ListHead, ListIter};
pub use node::{ChunkIdx, Layout, NIL, PENDING};
pub use particles::{DEFAULT_STORE_CEILING, DEFAULT_STORE_CHUNK, ParticleSource, ParticleStore};
pub use pool::{ChunkPool, PoolStats};
pub use tree::{GridStats, LeafBlock, SparseGrid};
