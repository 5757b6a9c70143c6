//! Parallel dispatch over index ranges.
//!
//! The grid and the rebuild controller never pick a backend themselves: the
//! caller hands them a [`Dispatch`]. Work is cut into groups of `group`
//! consecutive indices; groups exist for locality only and carry no ordering
//! guarantee.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rayon::prelude::*;

use super::error::GridError;

/// Below this many groups the pool runs the job on the calling thread.
const PARALLEL_MIN_GROUPS: usize = 2;

pub trait Dispatch: Sync {
    /// Upper bound on workers that may run `body` concurrently.
    fn workers(&self) -> usize;

    /// Run `body` over `0..len` in groups of `group` indices.
    ///
    /// Returns the first error a group reported. Once a group fails no new
    /// groups are started, but groups already running finish.
    fn dispatch<E, F>(&self, len: usize, group: usize, body: F) -> Result<(), E>
    where
        E: Send,
        F: Fn(Range<usize>) -> Result<(), E> + Sync;
}

/// Runs every group in order on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialDispatch;

impl Dispatch for SerialDispatch {
    fn workers(&self) -> usize {
        1
    }

    fn dispatch<E, F>(&self, len: usize, group: usize, body: F) -> Result<(), E>
    where
        E: Send,
        F: Fn(Range<usize>) -> Result<(), E> + Sync,
    {
        let group = group.max(1);
        let mut start = 0;
        while start < len {
            let end = (start + group).min(len);
            body(start..end)?;
            start = end;
        }
        Ok(())
    }
}

/// Rayon-backed dispatch. Workers pull groups from a shared atomic cursor.
pub struct PoolDispatch {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl PoolDispatch {
    pub fn new(threads: usize) -> Result<Self, GridError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("pic-index-{i}"))
            .build()
            .map_err(|err| GridError::WorkerPool(err.to_string()))?;
        Ok(Self { pool, threads })
    }
}

impl std::fmt::Debug for PoolDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDispatch")
            .field("threads", &self.threads)
            .finish()
    }
}

#[inline]
fn effective_workers(groups: usize, threads: usize) -> usize {
    if threads <= 1 || groups < PARALLEL_MIN_GROUPS {
        return 1;
    }
    groups.min(threads)
}

impl Dispatch for PoolDispatch {
    fn workers(&self) -> usize {
        self.threads
    }

    fn dispatch<E, F>(&self, len: usize, group: usize, body: F) -> Result<(), E>
    where
        E: Send,
        F: Fn(Range<usize>) -> Result<(), E> + Sync,
    {
        let group = group.max(1);
        let workers = effective_workers(len.div_ceil(group), self.threads);
        if workers <= 1 {
            return SerialDispatch.dispatch(len, group, body);
        }

        let cursor = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        self.pool.install(|| {
            (0..workers).into_par_iter().try_for_each(|_| {
                loop {
                    if failed.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    let start = cursor.fetch_add(group, Ordering::Relaxed);
                    if start >= len {
                        return Ok(());
                    }
                    let end = (start + group).min(len);
                    if let Err(err) = body(start..end) {
                        failed.store(true, Ordering::Relaxed);
                        return Err(err);
                    }
                }
            })
        })
    }
}
