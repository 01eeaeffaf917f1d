//! Storage strategies behind the [`ChunkStore`](crate::ChunkStore) facade
//!
//! - [`PagingEngine`]: region allocator plus swap file, the production engine
//! - [`PassThroughEngine`]: one heap buffer per chunk, nothing is swapped
//!
//! Both keep the same directory of handles and the same deref bookkeeping,
//! so callers cannot tell them apart except through the statistics.

pub mod paging;
pub mod passthrough;

pub use paging::PagingEngine;
pub use passthrough::PassThroughEngine;

use crate::config::EngineKind;
use crate::directory::DirectoryEntry;
use crate::error::Result;
use crate::fork::FrozenChunks;
use crate::reference::ChunkReference;
use crate::snapshot::Snapshot;
use crate::stats::{SizeBreakdown, StatsCategory, StatsReport};
use std::borrow::Cow;
use std::fmt;

/// Deref counter ceiling
pub const MAX_DEREFS: u8 = u8::MAX;

/// Deref count above which a region counts as hot
const HOT_REGION_DEREFS: u8 = MAX_DEREFS / 2;

/// Operations every storage strategy provides
///
/// Fork-state checks, null handling and the length limit are applied by
/// the facade before an engine is called.
pub trait ChunkEngine: Send + fmt::Debug {
    fn kind(&self) -> EngineKind;

    /// Store a new chunk with an initial deref count
    fn create(&mut self, data: &[u8], derefs: u8) -> Result<ChunkReference>;

    fn delete(&mut self, reference: ChunkReference) -> Result<()>;

    /// Chunk payload; counts as a dereference
    fn fetch(&mut self, reference: ChunkReference) -> Result<Cow<'_, [u8]>>;

    /// Chunk length; counts as a dereference
    fn length(&mut self, reference: ChunkReference) -> Result<u16>;

    fn deref_count(&self, reference: ChunkReference) -> Result<u8>;

    /// Improve placement of the given chunks; returns how many moved
    fn migrate(&mut self, references: &[ChunkReference]) -> Result<usize>;

    /// Halve every deref counter and reset per-period statistics
    fn new_period(&mut self);

    /// Page out cold chunks if resident use is above the high-water mark
    fn consider_eviction(&mut self) -> Result<usize>;

    fn num_swapped(&self) -> usize;

    fn chunk_count(&self) -> usize;

    fn references(&self) -> Vec<ChunkReference>;

    fn stats(&self, category: StatsCategory) -> StatsReport;

    fn flush(&mut self) -> Result<()>;

    /// Get ready for `fork()`
    fn fork_prepare(&mut self) -> Result<()>;

    /// Resume after `fork()` in the parent
    fn fork_parent(&mut self) -> Result<()>;

    /// Become the read-only view of the forked child
    fn into_fork_child(self: Box<Self>) -> Result<Box<dyn FrozenChunks>>;

    /// Release what the fork left behind
    fn fork_done(&mut self) -> Result<()>;

    /// Copy every chunk without disturbing placement or counters
    fn snapshot(&self) -> Result<Snapshot>;
}

/// Size classes and saturated-counter total of a set of entries
pub(crate) fn chunk_profile<'a, L: 'a>(
    entries: impl Iterator<Item = &'a DirectoryEntry<L>>,
) -> (SizeBreakdown, u64) {
    let mut sizes = SizeBreakdown::default();
    let mut maxed = 0;
    for entry in entries {
        sizes.add(entry.len as usize);
        if entry.derefs == MAX_DEREFS {
            maxed += 1;
        }
    }
    (sizes, maxed)
}

/// Whether enough regions run hot that counters should be aged
pub(crate) fn needs_new_period(region_averages: impl Iterator<Item = u8>) -> bool {
    let mut total = 0usize;
    let mut hot = 0usize;
    for average in region_averages {
        total += 1;
        if average > HOT_REGION_DEREFS {
            hot += 1;
        }
    }
    hot > total / 2
}
