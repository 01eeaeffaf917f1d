//! Pass-through engine: every chunk is its own heap buffer
//!
//! Useful on hosts with plenty of memory and as a reference for the paging
//! engine. Nothing is ever swapped or moved, so the fork hooks have nothing
//! to clone.

use super::{chunk_profile, ChunkEngine};
use crate::config::EngineKind;
use crate::directory::{ChunkDirectory, DirectoryEntry};
use crate::error::Result;
use crate::fork::FrozenChunks;
use crate::reference::ChunkReference;
use crate::snapshot::Snapshot;
use crate::stats::{Counters, Histogram, StatsCategory, StatsReport, Summary};
use std::borrow::Cow;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct PassThroughEngine {
    directory: ChunkDirectory<Box<[u8]>>,
    counters: Counters,
    tick: u64,
}

impl PassThroughEngine {
    pub fn new() -> Self {
        info!("Chunk store using pass-through engine");
        Self::default()
    }

    fn touch(&mut self, reference: ChunkReference) -> Result<&DirectoryEntry<Box<[u8]>>> {
        self.tick += 1;
        let entry = self.directory.get_mut(reference)?;
        entry.derefs = entry.derefs.saturating_add(1);
        entry.last_access = self.tick;
        self.counters.derefs += 1;
        Ok(entry)
    }
}

impl ChunkEngine for PassThroughEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::PassThrough
    }

    fn create(&mut self, data: &[u8], derefs: u8) -> Result<ChunkReference> {
        self.tick += 1;
        let reference = self.directory.insert(DirectoryEntry {
            len: data.len() as u16,
            derefs,
            last_access: self.tick,
            location: data.into(),
        })?;
        self.counters.creates += 1;
        debug!("Created {} ({} bytes)", reference, data.len());
        Ok(reference)
    }

    fn delete(&mut self, reference: ChunkReference) -> Result<()> {
        self.directory.remove(reference)?;
        self.counters.deletes += 1;
        debug!("Deleted {}", reference);
        Ok(())
    }

    fn fetch(&mut self, reference: ChunkReference) -> Result<Cow<'_, [u8]>> {
        let entry = self.touch(reference)?;
        Ok(Cow::Borrowed(&entry.location[..]))
    }

    fn length(&mut self, reference: ChunkReference) -> Result<u16> {
        Ok(self.touch(reference)?.len)
    }

    fn deref_count(&self, reference: ChunkReference) -> Result<u8> {
        Ok(self.directory.get(reference)?.derefs)
    }

    fn migrate(&mut self, references: &[ChunkReference]) -> Result<usize> {
        for &reference in references.iter().filter(|r| !r.is_null()) {
            self.directory.get(reference)?;
        }
        Ok(0)
    }

    fn new_period(&mut self) {
        self.counters.start_period();
        for (_, entry) in self.directory.iter_mut() {
            entry.derefs >>= 1;
        }
        info!("Started chunk period {}", self.counters.period);
    }

    fn consider_eviction(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn num_swapped(&self) -> usize {
        0
    }

    fn chunk_count(&self) -> usize {
        self.directory.len()
    }

    fn references(&self) -> Vec<ChunkReference> {
        self.directory.references()
    }

    fn stats(&self, category: StatsCategory) -> StatsReport {
        match category {
            StatsCategory::Summary => {
                let (chunks, maxed_chunks) = chunk_profile(self.directory.iter().map(|(_, e)| e));
                let used_bytes = chunks.total().bytes;
                StatsReport::Summary(Summary {
                    engine: self.kind().name(),
                    chunks,
                    overhead_bytes: 0,
                    free_extents: 0,
                    free_bytes: 0,
                    fragmented_bytes: 0,
                    storage_bytes: used_bytes,
                    used_bytes,
                    regions: 0,
                    swapped_chunks: 0,
                    swap_bytes: 0,
                    page_out: 0,
                    page_in: 0,
                    swap_failures: 0,
                    period: self.counters.period,
                    period_derefs: self.counters.derefs,
                    maxed_chunks,
                    creates: self.counters.creates,
                    deletes: self.counters.deletes,
                    migrate_slide: 0,
                    migrate_fill: 0,
                    migrate_away: 0,
                })
            }
            StatsCategory::RegionHistogram => StatsReport::RegionHistogram(Histogram::from_values(
                "Chart number of regions (y) vs. references (x)",
                &[0; 256],
            )),
            StatsCategory::PagingHistogram => StatsReport::PagingHistogram(Histogram::from_values(
                "Chart pages in/out (y) vs. references (x)",
                &self.counters.paging_histogram,
            )),
            StatsCategory::FreeSpaceHistogram => {
                StatsReport::FreeSpaceHistogram(Histogram::from_values(
                    "Chart region free space (y) vs. references (x)",
                    &[0; 256],
                ))
            }
            StatsCategory::Regions => StatsReport::Regions {
                regions: Vec::new(),
            },
            StatsCategory::Paging => StatsReport::Paging {
                page_out: 0,
                page_in: 0,
            },
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn fork_prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn fork_parent(&mut self) -> Result<()> {
        Ok(())
    }

    fn into_fork_child(self: Box<Self>) -> Result<Box<dyn FrozenChunks>> {
        Ok(Box::new(FrozenPassThrough {
            directory: self.directory,
        }))
    }

    fn fork_done(&mut self) -> Result<()> {
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot::from_chunks(self.directory.iter().map(
            |(reference, entry)| (reference, entry.derefs, entry.location.to_vec()),
        )))
    }
}

/// Pass-through chunks as seen by a forked child
#[derive(Debug)]
struct FrozenPassThrough {
    directory: ChunkDirectory<Box<[u8]>>,
}

impl FrozenChunks for FrozenPassThrough {
    fn fetch(&self, reference: ChunkReference) -> Result<Vec<u8>> {
        Ok(self.directory.get(reference)?.location.to_vec())
    }

    fn length(&self, reference: ChunkReference) -> Result<u16> {
        Ok(self.directory.get(reference)?.len)
    }

    fn deref_count(&self, reference: ChunkReference) -> Result<u8> {
        Ok(self.directory.get(reference)?.derefs)
    }

    fn references(&self) -> Vec<ChunkReference> {
        self.directory.references()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChunkError;

    #[test]
    fn test_create_fetch_delete() {
        let mut engine = PassThroughEngine::new();
        let r = engine.create(b"hello", 0).unwrap();
        assert_eq!(&*engine.fetch(r).unwrap(), b"hello");
        assert_eq!(engine.length(r).unwrap(), 5);
        assert_eq!(engine.deref_count(r).unwrap(), 2);

        engine.delete(r).unwrap();
        assert!(matches!(engine.fetch(r), Err(ChunkError::InvalidReference(_))));
        assert_eq!(engine.chunk_count(), 0);
    }

    #[test]
    fn test_new_period_halves_derefs() {
        let mut engine = PassThroughEngine::new();
        let r = engine.create(b"x", 255).unwrap();
        engine.fetch(r).unwrap();
        assert_eq!(engine.deref_count(r).unwrap(), 255);
        engine.new_period();
        assert_eq!(engine.deref_count(r).unwrap(), 127);
    }

    #[test]
    fn test_summary_counts_chunks() {
        let mut engine = PassThroughEngine::new();
        engine.create(&[0u8; 10], 0).unwrap();
        engine.create(&[0u8; 100], 255).unwrap();
        match engine.stats(StatsCategory::Summary) {
            StatsReport::Summary(summary) => {
                assert_eq!(summary.chunks.total().count, 2);
                assert_eq!(summary.used_bytes, 110);
                assert_eq!(summary.maxed_chunks, 1);
                assert_eq!(summary.creates, 2);
            }
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_and_child_view_do_not_count_derefs() {
        let mut engine = PassThroughEngine::new();
        let r = engine.create(b"abc", 4).unwrap();

        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.get(r), Some(&b"abc"[..]));

        let child = Box::new(engine).into_fork_child().unwrap();
        assert_eq!(child.fetch(r).unwrap(), b"abc");
        assert_eq!(child.length(r).unwrap(), 3);
        assert_eq!(child.deref_count(r).unwrap(), 4);
        assert_eq!(child.references(), vec![r]);
    }
}
