//! Error taxonomy for the particle index.

use thiserror::Error;

/// Conditions that escape the core.
///
/// Slot races during activation never surface here: they are resolved by the
/// claim protocol. A read of an inactive path is `None`, not an error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GridError {
    /// The pool cannot carve another chunk and its free list is empty.
    #[error("allocator exhausted: `{pool}` pool cannot back more than {max_chunks} chunks")]
    AllocatorExhausted { pool: &'static str, max_chunks: u32 },

    /// A dynamic list was asked to hold more values than its capacity.
    #[error("dynamic list is full (capacity {capacity})")]
    ListFull { capacity: u32 },

    /// A coordinate fell outside the logical domain of the grid.
    #[error("coordinate {coord:?} lies outside the {extent}-cell domain")]
    OutOfDomain { coord: Vec<i32>, extent: u32 },

    /// A particle position has a NaN or infinite axis.
    #[error("particle {id} has a non-finite position")]
    NonFinitePosition { id: u32 },

    /// The particle store reached its static ceiling.
    #[error("particle store is full (ceiling {ceiling})")]
    StoreFull { ceiling: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

impl GridError {
    /// Whether the error comes from running out of chunk memory.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, GridError::AllocatorExhausted { .. })
    }
}
