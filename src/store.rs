//! The public chunk store
//!
//! [`ChunkStore`] is what the attribute layer talks to. It owns the engine
//! chosen by the configuration, applies the rules every engine shares (null
//! handling, the length limit, the fork protocol) and forwards the rest.

use crate::config::{EngineKind, StoreConfig};
use crate::engine::{ChunkEngine, PagingEngine, PassThroughEngine};
use crate::error::{ChunkError, Result};
use crate::fork::{ForkChild, ForkCoordinator, ForkState};
use crate::reference::ChunkReference;
use crate::snapshot::Snapshot;
use crate::stats::{StatsCategory, StatsReport};
use std::path::PathBuf;
use tracing::{debug, info};

/// Variable-length blob store with stable handles
///
/// # Examples
///
/// ```rust,no_run
/// use chunk_store::{ChunkStoreBuilder, Result};
///
/// # fn main() -> Result<()> {
/// let mut store = ChunkStoreBuilder::new()
///     .swap_path("/var/tmp/world.swap")
///     .build()?;
///
/// let desc = store.create(b"A small stone cottage.", 0)?;
/// assert_eq!(store.fetch_vec(desc)?, b"A small stone cottage.");
/// store.delete(desc)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ChunkStore {
    engine: Box<dyn ChunkEngine>,
    config: StoreConfig,
    fork: ForkCoordinator,
}

impl ChunkStore {
    /// Validate `config` and start the configured engine
    ///
    /// The paging engine truncates (or creates) its swap file here.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let engine: Box<dyn ChunkEngine> = match config.engine {
            EngineKind::Paging => Box::new(PagingEngine::new(&config)?),
            EngineKind::PassThrough => Box::new(PassThroughEngine::new()),
        };
        info!(
            "Chunk store ready ({} engine, chunks up to {} bytes)",
            engine.kind().name(),
            config.max_chunk_len
        );

        Ok(ChunkStore {
            engine,
            config,
            fork: ForkCoordinator::new(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine.kind()
    }

    /// Store `data` with an initial deref count
    pub fn create(&mut self, data: &[u8], derefs: u8) -> Result<ChunkReference> {
        self.fork.check_mutation("create")?;
        if data.len() > self.config.max_chunk_len {
            return Err(ChunkError::ChunkTooLong {
                len: data.len(),
                max: self.config.max_chunk_len,
            });
        }
        self.engine.create(data, derefs)
    }

    /// Delete a chunk; deleting the null reference does nothing
    pub fn delete(&mut self, reference: ChunkReference) -> Result<()> {
        self.fork.check_mutation("delete")?;
        if reference.is_null() {
            return Ok(());
        }
        self.engine.delete(reference)
    }

    /// Copy a chunk into `buffer` and return its length
    ///
    /// When `buffer` is too small nothing is copied and the true length is
    /// still returned, so the caller can retry with a larger buffer. The
    /// null reference has length 0.
    pub fn fetch(&mut self, reference: ChunkReference, buffer: &mut [u8]) -> Result<usize> {
        self.fork.check_mutation("fetch")?;
        if reference.is_null() {
            return Ok(0);
        }
        let data = self.engine.fetch(reference)?;
        if data.len() <= buffer.len() {
            buffer[..data.len()].copy_from_slice(&data);
        }
        Ok(data.len())
    }

    /// Fetch a chunk into a fresh vector
    pub fn fetch_vec(&mut self, reference: ChunkReference) -> Result<Vec<u8>> {
        self.fork.check_mutation("fetch")?;
        if reference.is_null() {
            return Ok(Vec::new());
        }
        Ok(self.engine.fetch(reference)?.into_owned())
    }

    /// Length of a chunk; counts as an access
    pub fn length(&mut self, reference: ChunkReference) -> Result<u16> {
        self.fork.check_mutation("length")?;
        if reference.is_null() {
            return Ok(0);
        }
        self.engine.length(reference)
    }

    /// Current deref counter of a chunk
    pub fn deref_count(&self, reference: ChunkReference) -> Result<u8> {
        if reference.is_null() {
            return Ok(0);
        }
        self.engine.deref_count(reference)
    }

    /// Move the given chunks to better places; handles never change
    ///
    /// May start a new aging period first when most regions run hot.
    /// Returns the number of chunks moved.
    pub fn migrate(&mut self, references: &[ChunkReference]) -> Result<usize> {
        self.fork.check_mutation("migrate")?;
        self.engine.migrate(references)
    }

    /// Halve every deref counter and start fresh period statistics
    pub fn new_period(&mut self) -> Result<()> {
        self.fork.check_mutation("new_period")?;
        self.engine.new_period();
        Ok(())
    }

    /// Evict cold chunks if resident memory is above the high-water mark
    pub fn consider_eviction(&mut self) -> Result<usize> {
        self.fork.check_mutation("consider_eviction")?;
        self.engine.consider_eviction()
    }

    /// Number of chunks currently in the swap file
    pub fn num_swapped(&self) -> usize {
        self.engine.num_swapped()
    }

    /// Number of live chunks
    pub fn len(&self) -> usize {
        self.engine.chunk_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live chunk, in handle order
    pub fn references(&self) -> Vec<ChunkReference> {
        self.engine.references()
    }

    pub fn stats(&self, category: StatsCategory) -> StatsReport {
        self.engine.stats(category)
    }

    /// Push buffered swap writes to the operating system
    pub fn flush(&mut self) -> Result<()> {
        self.engine.flush()
    }

    pub fn fork_state(&self) -> ForkState {
        self.fork.state()
    }

    /// Get ready for `fork()`: flush and clone the swap file for the child
    pub fn prepare_for_fork(&mut self) -> Result<()> {
        self.fork.require("prepare_for_fork", &[ForkState::Normal])?;
        self.engine.flush()?;
        self.engine.fork_prepare()?;
        self.fork.enter(ForkState::Prepared);
        Ok(())
    }

    /// Resume normal service in the parent after `fork()`
    pub fn after_fork_in_parent(&mut self) -> Result<()> {
        self.fork
            .require("after_fork_in_parent", &[ForkState::Prepared])?;
        self.engine.fork_parent()?;
        self.fork.enter(ForkState::ParentResumed);
        Ok(())
    }

    /// Turn the store into the child's read-only view after `fork()`
    ///
    /// The store is consumed; on a protocol violation it is dropped.
    pub fn after_fork_in_child(mut self) -> Result<ForkChild> {
        self.fork
            .require("after_fork_in_child", &[ForkState::Prepared])?;
        self.fork.enter(ForkState::ChildSnapshotting);
        let frozen = self.engine.into_fork_child()?;
        Ok(ForkChild::new(frozen))
    }

    /// Finish a fork cycle and remove the child's swap clone
    pub fn fork_done(&mut self) -> Result<()> {
        self.fork.require(
            "fork_done",
            &[ForkState::Prepared, ForkState::ParentResumed],
        )?;
        self.engine.fork_done()?;
        self.fork.enter(ForkState::Normal);
        Ok(())
    }

    /// Fork the process for a dump
    ///
    /// Runs [`prepare_for_fork`](Self::prepare_for_fork), forks, and in the
    /// parent runs [`after_fork_in_parent`](Self::after_fork_in_parent). In
    /// the child the store is left prepared; call
    /// [`after_fork_in_child`](Self::after_fork_in_child) to get the frozen
    /// view. The parent calls [`fork_done`](Self::fork_done) once the child
    /// has finished.
    ///
    /// # Safety
    ///
    /// `fork()` only duplicates the calling thread. If other threads hold
    /// locks (including the allocator's), the child may deadlock. Call this
    /// only when the process is effectively single-threaded, or make the
    /// child restrict itself to reading the store and exiting.
    #[cfg(unix)]
    pub unsafe fn fork(&mut self) -> Result<crate::fork::ForkOutcome> {
        use crate::fork::ForkOutcome;

        self.prepare_for_fork()?;
        match libc::fork() {
            -1 => {
                let err = std::io::Error::last_os_error();
                self.fork_done()?;
                Err(err.into())
            }
            0 => Ok(ForkOutcome::Child),
            child_pid => {
                self.after_fork_in_parent()?;
                debug!("Forked dump child {}", child_pid);
                Ok(ForkOutcome::Parent { child_pid })
            }
        }
    }

    /// Copy every chunk into an immutable [`Snapshot`]
    ///
    /// Swapped chunks are read without being promoted, and no deref counter
    /// changes. The snapshot can be moved to another thread for export.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let snapshot = self.engine.snapshot()?;
        info!("Captured snapshot of {} chunks", snapshot.len());
        Ok(snapshot)
    }
}

/// Builder for a [`ChunkStore`]
///
/// ```rust,no_run
/// use chunk_store::{ChunkStoreBuilder, EngineKind};
///
/// # fn main() -> chunk_store::Result<()> {
/// let store = ChunkStoreBuilder::new()
///     .engine(EngineKind::Paging)
///     .region_size(64 * 1024)
///     .max_resident_bytes(256 * 1024 * 1024)
///     .swap_path("/var/tmp/world.swap")
///     .swap_limit_bytes(4 << 30)
///     .water_marks(0.9, 0.8)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChunkStoreBuilder {
    config: StoreConfig,
}

impl ChunkStoreBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: StoreConfig) -> Self {
        ChunkStoreBuilder { config }
    }

    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.config.engine = engine;
        self
    }

    pub fn region_size(mut self, bytes: usize) -> Self {
        self.config.region_size = bytes;
        self
    }

    pub fn max_resident_bytes(mut self, bytes: u64) -> Self {
        self.config.max_resident_bytes = bytes;
        self
    }

    pub fn max_chunk_len(mut self, len: usize) -> Self {
        self.config.max_chunk_len = len;
        self
    }

    pub fn swap_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.swap_path = path.into();
        self
    }

    pub fn swap_limit_bytes(mut self, bytes: u64) -> Self {
        self.config.swap_limit_bytes = Some(bytes);
        self
    }

    pub fn swap_initial_bytes(mut self, bytes: u64) -> Self {
        self.config.swap_initial_bytes = bytes;
        self
    }

    /// Evict above `high` and stop once below `low` (fractions of the budget)
    pub fn water_marks(mut self, high: f64, low: f64) -> Self {
        self.config.high_water = high;
        self.config.low_water = low;
        self
    }

    pub fn verify_swap_checksums(mut self, verify: bool) -> Self {
        self.config.verify_swap_checksums = verify;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn build(self) -> Result<ChunkStore> {
        ChunkStore::new(self.config)
    }
}
