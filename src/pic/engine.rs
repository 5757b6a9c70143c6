use std::sync::OnceLock;

use super::coord::Coord;
use super::dispatch::{Dispatch, PoolDispatch};
use super::error::GridError;
use super::list::LIST_CHUNK_OVERHEAD;
use super::node::Layout;
use super::particles::ParticleSource;
use super::tree::{GridStats, LeafBlock, SparseGrid};

/// Environment variable overriding the auto-detected worker count.
pub const THREADS_ENV: &str = "PIC_INDEX_THREADS";

const DEFAULT_ROOT_EXTENT: u32 = 32;
const DEFAULT_MID_EXTENT: u32 = 16;
const DEFAULT_LEAF_EXTENT: u32 = 8;
const DEFAULT_CELL_SIZE: f32 = 1.0 / 128.0;
const DEFAULT_LEAF_LIST_CAPACITY: u32 = 1 << 20;
const DEFAULT_CHUNK_SIZE: u32 = 4096;
const DEFAULT_MEMORY_BUDGET_BYTES: usize = 1 << 30;
const DEFAULT_GROUP_SIZE: usize = 256;

static PHYSICAL_CORES: OnceLock<usize> = OnceLock::new();

#[inline]
fn physical_core_count() -> usize {
    *PHYSICAL_CORES.get_or_init(|| num_cpus::get_physical().max(1))
}

/// One worker per physical core; `max_threads` caps it.
#[inline]
fn auto_pool_thread_count() -> usize {
    physical_core_count()
}

fn parse_thread_override(raw: &str) -> Option<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            log::warn!("ignoring {THREADS_ENV}={raw:?}: expected a positive integer");
            None
        }
    }
}

fn env_thread_override() -> Option<usize> {
    std::env::var(THREADS_ENV)
        .ok()
        .and_then(|raw| parse_thread_override(&raw))
}

/// Resolve the thread count from a config, falling back to the environment
/// and then to auto-detect.
fn resolve_thread_count(config: &ParticleIndexConfig) -> usize {
    let mut threads = config
        .thread_count
        .or_else(env_thread_override)
        .unwrap_or_else(auto_pool_thread_count);
    if let Some(cap) = config.max_threads {
        threads = threads.min(cap);
    }
    threads.max(1)
}

/// Configuration for a particle index instance.
///
/// Use `ParticleIndexConfig::default()` for the standard 4096-cell domain,
/// or customise individual knobs via the builder methods. Validated once when
/// the index is built.
#[derive(Clone, Debug)]
pub struct ParticleIndexConfig {
    /// Root table slots per axis.
    pub root_extent: u32,
    /// Leaf-block slots per mid-block per axis.
    pub mid_extent: u32,
    /// Cells per leaf-block per axis.
    pub leaf_extent: u32,
    /// Edge length of one cell in position units.
    pub cell_size: f32,
    /// Most ids a single leaf list may hold.
    pub leaf_list_capacity: u32,
    /// Ids per list chunk.
    pub chunk_size: u32,
    /// Upper bound on memory backing list chunks.
    pub memory_budget_bytes: usize,
    /// Particles handed to a worker at a time.
    pub group_size: usize,
    /// Number of threads for the worker pool.
    /// `None` means `PIC_INDEX_THREADS`, then one thread per physical core.
    pub thread_count: Option<usize>,
    /// Hard upper bound on threads regardless of auto-detection.
    pub max_threads: Option<usize>,
}

impl Default for ParticleIndexConfig {
    fn default() -> Self {
        Self {
            root_extent: DEFAULT_ROOT_EXTENT,
            mid_extent: DEFAULT_MID_EXTENT,
            leaf_extent: DEFAULT_LEAF_EXTENT,
            cell_size: DEFAULT_CELL_SIZE,
            leaf_list_capacity: DEFAULT_LEAF_LIST_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            group_size: DEFAULT_GROUP_SIZE,
            thread_count: None,
            max_threads: None,
        }
    }
}

impl ParticleIndexConfig {
    /// Set the per-axis extents of the three levels.
    pub fn extents(mut self, root: u32, mid: u32, leaf: u32) -> Self {
        self.root_extent = root;
        self.mid_extent = mid;
        self.leaf_extent = leaf;
        self
    }

    /// Grow or shrink the root table so the domain covers at least `cells`
    /// per axis with the current mid and leaf extents.
    pub fn domain_extent(mut self, cells: u32) -> Self {
        let per_root = self.mid_extent.max(1).saturating_mul(self.leaf_extent.max(1));
        self.root_extent = cells.div_ceil(per_root);
        self
    }

    pub fn cell_size(mut self, dx: f32) -> Self {
        self.cell_size = dx;
        self
    }

    pub fn leaf_list_capacity(mut self, n: u32) -> Self {
        self.leaf_list_capacity = n;
        self
    }

    pub fn chunk_size(mut self, n: u32) -> Self {
        self.chunk_size = n;
        self
    }

    pub fn memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn group_size(mut self, n: usize) -> Self {
        self.group_size = n;
        self
    }

    /// Set an explicit thread count for the worker pool.
    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = Some(n.max(1));
        self
    }

    /// Set a hard upper bound on threads.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n.max(1));
        self
    }

    /// List chunks the memory budget can back.
    pub fn max_list_chunks(&self) -> u32 {
        let chunk_bytes =
            (LIST_CHUNK_OVERHEAD + self.chunk_size as usize) * std::mem::size_of::<u32>();
        (self.memory_budget_bytes / chunk_bytes).min(u32::MAX as usize) as u32
    }

    /// Check every knob and derive the tree layout.
    pub fn validate<const D: usize>(&self) -> Result<Layout<D>, GridError> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(GridError::InvalidConfig(format!(
                "cell size must be positive and finite, got {}",
                self.cell_size
            )));
        }
        if self.group_size == 0 {
            return Err(GridError::InvalidConfig("group size must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(GridError::InvalidConfig("chunk size must be positive".into()));
        }
        if self.leaf_list_capacity == 0 {
            return Err(GridError::InvalidConfig(
                "leaf list capacity must be positive".into(),
            ));
        }
        if self.max_list_chunks() == 0 {
            return Err(GridError::InvalidConfig(format!(
                "memory budget of {} bytes cannot hold one chunk of {} ids",
                self.memory_budget_bytes, self.chunk_size
            )));
        }
        Layout::new(self.root_extent, self.mid_extent, self.leaf_extent)
    }
}

/// Where the controller is in its step cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No step running; the tree reflects the last completed rebuild.
    Idle,
    /// Deactivation or the particle scan is in progress.
    Rebuild,
    /// The last step failed. The tree holds a partial rebuild until the next
    /// step deactivates it.
    Faulted,
}

/// Rebuilds the sparse grid from particle positions once per step.
pub struct ParticleIndex<const D: usize, X: Dispatch = PoolDispatch> {
    grid: SparseGrid<D>,
    dispatch: X,
    config: ParticleIndexConfig,
    inv_dx: f32,
    phase: Phase,
    steps: u64,
}

impl<const D: usize> ParticleIndex<D, PoolDispatch> {
    pub fn new() -> Result<Self, GridError> {
        Self::with_config(ParticleIndexConfig::default())
    }

    /// Create an index with its own worker pool.
    pub fn with_config(config: ParticleIndexConfig) -> Result<Self, GridError> {
        let threads = resolve_thread_count(&config);
        let dispatch = PoolDispatch::new(threads)?;
        Self::with_dispatch(config, dispatch)
    }
}

impl<const D: usize, X: Dispatch> ParticleIndex<D, X> {
    /// Create an index that runs its parallel passes through `dispatch`.
    pub fn with_dispatch(config: ParticleIndexConfig, dispatch: X) -> Result<Self, GridError> {
        let layout = config.validate::<D>()?;
        let grid = SparseGrid::new(
            layout,
            config.leaf_list_capacity,
            config.chunk_size,
            config.max_list_chunks(),
        )?;
        log::debug!(
            "particle index: {D}-D domain of {} cells per axis, {} workers",
            layout.domain(),
            dispatch.workers()
        );
        Ok(Self {
            grid,
            dispatch,
            inv_dx: 1.0 / config.cell_size,
            config,
            phase: Phase::Idle,
            steps: 0,
        })
    }

    #[inline]
    pub fn config(&self) -> &ParticleIndexConfig {
        &self.config
    }

    #[inline]
    pub fn dispatch(&self) -> &X {
        &self.dispatch
    }

    #[inline]
    pub fn grid(&self) -> &SparseGrid<D> {
        &self.grid
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed rebuilds.
    #[inline]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    #[inline]
    pub fn stats(&self) -> GridStats {
        self.grid.stats()
    }

    /// Cell coordinate a particle at `position` is binned into.
    #[inline]
    /// Saturates far-away axes; see [`Coord::from_position`].
    pub fn coord_of(&self, position: [f32; D]) -> Coord<D> {
        Coord::from_position(position, self.inv_dx)
    }

    /// Deactivate the tree, then append every particle id into the list of
    /// the leaf owning its cell.
    ///
    /// On error the index is left `Faulted`; the next step starts from a
    /// clean tree regardless.
    pub fn step<P>(&mut self, particles: &P) -> Result<(), GridError>
    where
        P: ParticleSource<D> + ?Sized,
    {
        self.phase = Phase::Rebuild;
        self.grid.deactivate_all_in(&self.dispatch);

        match self.rebuild(particles) {
            Ok(()) => {
                self.phase = Phase::Idle;
                self.steps += 1;
                log::trace!(
                    "step {}: {} particles in {} leaves under {} mid-blocks",
                    self.steps,
                    particles.len(),
                    self.grid.active_leaf_count(),
                    self.grid.active_mid_count()
                );
                Ok(())
            }
            Err(err) => {
                self.phase = Phase::Faulted;
                log::warn!("rebuild after step {} failed: {err}", self.steps);
                Err(err)
            }
        }
    }

    pub fn step_n<P>(&mut self, particles: &P, n: u64) -> Result<(), GridError>
    where
        P: ParticleSource<D> + ?Sized,
    {
        for _ in 0..n {
            self.step(particles)?;
        }
        Ok(())
    }

    fn rebuild<P>(&self, particles: &P) -> Result<(), GridError>
    where
        P: ParticleSource<D> + ?Sized,
    {
        let len = particles.len();
        if len > u32::MAX as usize {
            return Err(GridError::StoreFull {
                ceiling: u32::MAX as usize,
            });
        }
        let grid = &self.grid;
        let inv_dx = self.inv_dx;
        self.dispatch
            .dispatch(len, self.config.group_size, |range| {
                for id in range {
                    let coord = Coord::try_from_position(particles.position(id), inv_dx)
                        .ok_or(GridError::NonFinitePosition { id: id as u32 })?;
                    grid.activate_path(coord)?.particles().append(id as u32)?;
                }
                Ok(())
            })
    }

    pub fn active_leaves(&self) -> impl Iterator<Item = LeafBlock<'_, D>> + '_ {
        self.grid.active_leaves()
    }

    pub fn for_each_active_leaf<F: FnMut(LeafBlock<'_, D>)>(&self, visit: F) {
        self.grid.for_each_active_leaf(visit);
    }

    #[inline]
    pub fn leaf_for(&self, coord: Coord<D>) -> Option<LeafBlock<'_, D>> {
        self.grid.leaf_for(coord)
    }

    /// Leaf holding the particle binned at `position`, if any.
    #[inline]
    pub fn leaf_for_position(&self, position: [f32; D]) -> Option<LeafBlock<'_, D>> {
        self.grid
            .leaf_for(Coord::try_from_position(position, self.inv_dx)?)
    }
}
