//! Paging engine: regions in memory, cold chunks in a swap file
//!
//! ```text
//! create ──→ RegionAllocator::store ──(OutOfSpace)──→ evict coldest ──→ retry
//!                 │                                        │
//!                 ↓                                        ↓
//!          Location::Resident                     SwapFile::store(record)
//!                 ↑                                        │
//!                 └────── promote on fetch ←── Location::Swapped { offset, crc }
//! ```
//!
//! Every resident chunk is listed in the [`ColdIndex`]; every swapped chunk
//! has exactly one record in the swap file. The directory entry is only
//! switched to a new location after the bytes have been written there.

use super::{chunk_profile, needs_new_period, ChunkEngine};
use crate::allocator::region::Region;
use crate::allocator::{MoveKind, RegionAllocator, SlotLocation};
use crate::config::{EngineKind, StoreConfig};
use crate::directory::{ChunkDirectory, DirectoryEntry};
use crate::error::{ChunkError, Result};
use crate::fork::FrozenChunks;
use crate::record;
use crate::reference::ChunkReference;
use crate::snapshot::Snapshot;
use crate::stats::{Counters, Histogram, RegionStats, StatsCategory, StatsReport, Summary};
use crate::swap::{ColdIndex, ColdKey, SwapFile};
use std::borrow::Cow;
use std::io;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Where a chunk's bytes currently live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Resident(SlotLocation),
    Swapped { offset: u64, crc: u32 },
}

#[derive(Debug)]
pub struct PagingEngine {
    directory: ChunkDirectory<Location>,
    allocator: RegionAllocator,
    swap: SwapFile,
    /// Swap clone made by `fork_prepare`, owned until the child takes it
    child_swap: Option<SwapFile>,
    child_swap_path: Option<PathBuf>,
    cold: ColdIndex,
    counters: Counters,
    tick: u64,
    swapped: usize,
    high_water: f64,
    low_water: f64,
    verify_checksums: bool,
}

fn cold_key(reference: ChunkReference, entry: &DirectoryEntry<Location>) -> ColdKey {
    ColdKey::new(entry.derefs, entry.last_access, reference)
}

/// Read and validate the swap record of a chunk
fn read_swapped(
    swap: &SwapFile,
    verify: bool,
    reference: ChunkReference,
    len: u16,
    offset: u64,
    crc: u32,
) -> Result<Vec<u8>> {
    let swap_error = |source: io::Error| {
        error!("Swap read for {} at offset {} failed: {}", reference, offset, source);
        ChunkError::SwapIo { reference, source }
    };

    let bytes = swap
        .read(offset, record::record_len(len as usize))
        .map_err(swap_error)?;

    if verify && crc32fast::hash(&bytes) != crc {
        return Err(swap_error(io::Error::new(
            io::ErrorKind::InvalidData,
            "swap record checksum mismatch",
        )));
    }

    let (header, payload) = record::decode_record(&bytes).map_err(swap_error)?;
    if header.len != len {
        return Err(swap_error(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "swap record holds {} bytes, directory expects {}",
                header.len, len
            ),
        )));
    }
    Ok(payload.to_vec())
}

/// Copy a chunk out of memory or swap without touching counters
fn copy_chunk(
    directory: &ChunkDirectory<Location>,
    allocator: &RegionAllocator,
    swap: &SwapFile,
    verify: bool,
    reference: ChunkReference,
) -> Result<Vec<u8>> {
    let entry = directory.get(reference)?;
    match entry.location {
        Location::Resident(slot) => Ok(allocator.payload(slot).to_vec()),
        Location::Swapped { offset, crc } => {
            read_swapped(swap, verify, reference, entry.len, offset, crc)
        }
    }
}

impl PagingEngine {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let swap = SwapFile::create(
            &config.swap_path,
            config.swap_initial_bytes,
            config.swap_limit_bytes,
        )?;
        let allocator = RegionAllocator::new(config.region_size, config.max_regions());

        info!(
            "Chunk store using paging engine: {} regions of {} bytes, swap at {}",
            allocator.max_regions(),
            allocator.region_size(),
            swap.path().display()
        );

        Ok(PagingEngine {
            directory: ChunkDirectory::new(),
            allocator,
            swap,
            child_swap: None,
            child_swap_path: None,
            cold: ColdIndex::new(),
            counters: Counters::default(),
            tick: 0,
            swapped: 0,
            high_water: config.high_water,
            low_water: config.low_water,
            verify_checksums: config.verify_swap_checksums,
        })
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Reserve a resident slot, evicting cold chunks while memory is full
    ///
    /// With `colder_than` set, only chunks colder than that key may be
    /// evicted to make room.
    fn place(
        &mut self,
        data: &[u8],
        derefs: u8,
        colder_than: Option<ColdKey>,
    ) -> Result<SlotLocation> {
        loop {
            match self.allocator.store(data, derefs) {
                Ok(slot) => return Ok(slot),
                Err(ChunkError::OutOfSpace { .. }) => {
                    if !self.evict_one(colder_than) {
                        return Err(ChunkError::OutOfSpace {
                            requested: data.len(),
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Page out the coldest chunk that can be written to swap
    ///
    /// With `limit` set, only chunks colder than `limit` qualify. Returns
    /// false when no candidate could be evicted.
    fn evict_one(&mut self, limit: Option<ColdKey>) -> bool {
        let mut cursor = None;
        while let Some(key) = self.cold.next_after(cursor) {
            if limit.map_or(false, |limit| key >= limit) {
                return false;
            }
            match self.page_out(key) {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Could not evict {}: {}", key.reference, e);
                    self.counters.swap_failures += 1;
                    cursor = Some(key);
                }
            }
        }
        false
    }

    /// Move one resident chunk to the swap file
    fn page_out(&mut self, key: ColdKey) -> Result<()> {
        let reference = key.reference;
        let entry = self.directory.get(reference)?;
        let (slot, derefs) = match entry.location {
            Location::Resident(slot) => (slot, entry.derefs),
            Location::Swapped { .. } => return Err(ChunkError::InvalidReference(reference)),
        };

        let bytes = record::record_from_slot(self.allocator.slot(slot), derefs);
        let crc = crc32fast::hash(&bytes);
        let offset = self
            .swap
            .store(&bytes)
            .map_err(|source| ChunkError::SwapIo { reference, source })?;

        self.directory.get_mut(reference)?.location = Location::Swapped { offset, crc };
        self.allocator.free(slot, derefs);
        self.cold.remove(&key);
        self.swapped += 1;
        self.counters.record_page_out(derefs);

        debug!(
            "Paged out {} ({} bytes, {} derefs) to offset {}",
            reference,
            bytes.len(),
            derefs,
            offset
        );
        Ok(())
    }

    /// Bring a swapped chunk back into memory if there is room
    ///
    /// With `evict` set, chunks colder than the promoted one are paged out
    /// to make room. On failure the chunk simply stays swapped.
    fn promote(&mut self, reference: ChunkReference, data: &[u8], evict: bool) -> bool {
        let entry = match self.directory.get(reference) {
            Ok(entry) => entry,
            Err(_) => return false,
        };
        let (offset, len) = match entry.location {
            Location::Swapped { offset, .. } => (offset, entry.len),
            Location::Resident(_) => return false,
        };
        let key = cold_key(reference, entry);
        let derefs = entry.derefs;

        let placed = if evict {
            self.place(data, derefs, Some(key))
        } else {
            self.allocator.store(data, derefs)
        };
        let slot = match placed {
            Ok(slot) => slot,
            Err(_) => {
                debug!("No room to promote {}, leaving it swapped", reference);
                return false;
            }
        };

        // Eviction above never touches this entry: it is not resident
        if let Ok(entry) = self.directory.get_mut(reference) {
            entry.location = Location::Resident(slot);
        }
        self.swap.release(offset, record::record_len(len as usize));
        self.cold.insert(key);
        self.swapped -= 1;
        self.counters.record_page_in(derefs);

        debug!("Paged in {} ({} derefs)", reference, derefs);
        true
    }

    /// Count a dereference and return the chunk's location
    fn touch(&mut self, reference: ChunkReference) -> Result<Location> {
        let tick = self.next_tick();
        let entry = self.directory.get_mut(reference)?;
        let old_key = cold_key(reference, entry);
        entry.derefs = entry.derefs.saturating_add(1);
        entry.last_access = tick;
        let new_key = cold_key(reference, entry);
        let location = entry.location;

        self.counters.derefs += 1;
        if let Location::Resident(slot) = location {
            if new_key.derefs != old_key.derefs {
                self.allocator.add_derefs(slot.region, 1);
            }
            self.cold.update(&old_key, new_key);
        }
        Ok(location)
    }

    /// Age counters when most regions are hot
    fn maybe_start_period(&mut self) {
        let averages = self.allocator.regions().iter().map(|r| r.average_derefs());
        if needs_new_period(averages) {
            debug!("Most regions are hot, aging deref counters");
            self.new_period();
        }
    }

    fn summary(&self) -> Summary {
        let (chunks, maxed_chunks) = chunk_profile(self.directory.iter().map(|(_, e)| e));
        let overhead_bytes = self
            .directory
            .iter()
            .filter(|(_, e)| matches!(e.location, Location::Resident(_)))
            .map(|(_, e)| (record::slot_len(e.len as usize) - e.len as usize) as u64)
            .sum();
        let regions = self.allocator.regions();

        Summary {
            engine: self.kind().name(),
            chunks,
            overhead_bytes,
            free_extents: regions.iter().map(|r| r.free_count() as u64).sum(),
            free_bytes: self.allocator.free_bytes(),
            fragmented_bytes: self.allocator.fragmented_bytes(),
            storage_bytes: regions.iter().map(|r| r.capacity()).sum(),
            used_bytes: self.allocator.used_bytes(),
            regions: regions.len() as u64,
            swapped_chunks: self.swapped as u64,
            swap_bytes: self.swap.used_bytes(),
            page_out: self.counters.page_out,
            page_in: self.counters.page_in,
            swap_failures: self.counters.swap_failures,
            period: self.counters.period,
            period_derefs: self.counters.derefs,
            maxed_chunks,
            creates: self.counters.creates,
            deletes: self.counters.deletes,
            migrate_slide: self.counters.migrate_slide,
            migrate_fill: self.counters.migrate_fill,
            migrate_away: self.counters.migrate_away,
        }
    }

    fn region_values(&self, value: impl Fn(&Region) -> u64) -> [u64; 256] {
        let mut values = [0u64; 256];
        for region in self.allocator.regions() {
            values[region.average_derefs() as usize] += value(region);
        }
        values
    }
}

impl ChunkEngine for PagingEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Paging
    }

    fn create(&mut self, data: &[u8], derefs: u8) -> Result<ChunkReference> {
        let slot = self.place(data, derefs, None)?;
        let tick = self.next_tick();
        let entry = DirectoryEntry {
            len: data.len() as u16,
            derefs,
            last_access: tick,
            location: Location::Resident(slot),
        };

        let reference = match self.directory.insert(entry) {
            Ok(reference) => reference,
            Err(e) => {
                self.allocator.free(slot, derefs);
                return Err(e);
            }
        };
        self.cold.insert(ColdKey::new(derefs, tick, reference));
        self.counters.creates += 1;
        debug!(
            "Created {} ({} bytes) in region {} at offset {}",
            reference,
            data.len(),
            slot.region,
            slot.offset
        );

        self.consider_eviction()?;
        Ok(reference)
    }

    fn delete(&mut self, reference: ChunkReference) -> Result<()> {
        let entry = self.directory.remove(reference)?;
        match entry.location {
            Location::Resident(slot) => {
                self.cold.remove(&cold_key(reference, &entry));
                self.allocator.free(slot, entry.derefs);
            }
            Location::Swapped { offset, .. } => {
                self.swap
                    .release(offset, record::record_len(entry.len as usize));
                self.swapped -= 1;
            }
        }
        self.counters.deletes += 1;
        debug!("Deleted {}", reference);
        Ok(())
    }

    fn fetch(&mut self, reference: ChunkReference) -> Result<Cow<'_, [u8]>> {
        // Read swapped bytes before counting the access so a failed read
        // leaves the entry untouched
        let swapped = match self.directory.get(reference)?.location {
            Location::Resident(_) => None,
            Location::Swapped { .. } => Some(copy_chunk(
                &self.directory,
                &self.allocator,
                &self.swap,
                self.verify_checksums,
                reference,
            )?),
        };

        let location = self.touch(reference)?;
        match (location, swapped) {
            (Location::Resident(slot), _) => Ok(Cow::Borrowed(self.allocator.payload(slot))),
            (Location::Swapped { .. }, Some(data)) => {
                self.promote(reference, &data, true);
                Ok(Cow::Owned(data))
            }
            (Location::Swapped { .. }, None) => Err(ChunkError::InvalidReference(reference)),
        }
    }

    fn length(&mut self, reference: ChunkReference) -> Result<u16> {
        self.touch(reference)?;
        Ok(self.directory.get(reference)?.len)
    }

    fn deref_count(&self, reference: ChunkReference) -> Result<u8> {
        Ok(self.directory.get(reference)?.derefs)
    }

    fn migrate(&mut self, references: &[ChunkReference]) -> Result<usize> {
        for &reference in references.iter().filter(|r| !r.is_null()) {
            self.directory.get(reference)?;
        }
        self.maybe_start_period();

        let mut moved = 0;
        for &reference in references.iter().filter(|r| !r.is_null()) {
            let entry = self.directory.get(reference)?;
            let derefs = entry.derefs;
            match entry.location {
                Location::Resident(slot) => {
                    let Some((new_slot, kind)) = self.allocator.migrate(slot, derefs) else {
                        continue;
                    };
                    self.directory.get_mut(reference)?.location = Location::Resident(new_slot);
                    match kind {
                        MoveKind::Slide => self.counters.migrate_slide += 1,
                        MoveKind::Fill => self.counters.migrate_fill += 1,
                        MoveKind::Away => self.counters.migrate_away += 1,
                    }
                    moved += 1;
                }
                Location::Swapped { offset, crc } => {
                    // A swapped chunk the caller still uses comes back if it fits
                    let data = read_swapped(
                        &self.swap,
                        self.verify_checksums,
                        reference,
                        entry.len,
                        offset,
                        crc,
                    )?;
                    self.promote(reference, &data, false);
                }
            }
        }

        debug!("Migrated {} of {} chunks", moved, references.len());
        Ok(moved)
    }

    fn new_period(&mut self) {
        self.counters.start_period();
        self.allocator.reset_derefs();
        self.cold.clear();

        for (reference, entry) in self.directory.iter_mut() {
            entry.derefs >>= 1;
            if let Location::Resident(slot) = entry.location {
                self.allocator.add_derefs(slot.region, entry.derefs as u64);
                self.cold.insert(ColdKey::new(entry.derefs, entry.last_access, reference));
            }
        }
        info!("Started chunk period {}", self.counters.period);
    }

    fn consider_eviction(&mut self) -> Result<usize> {
        let capacity = self.allocator.capacity_bytes() as f64;
        if (self.allocator.used_bytes() as f64) <= capacity * self.high_water {
            return Ok(0);
        }

        let target = (capacity * self.low_water) as u64;
        let mut evicted = 0;
        let mut cursor = None;
        while self.allocator.used_bytes() > target {
            let Some(key) = self.cold.next_after(cursor) else {
                break;
            };
            match self.page_out(key) {
                Ok(()) => evicted += 1,
                Err(e) => {
                    warn!("Could not evict {}: {}", key.reference, e);
                    self.counters.swap_failures += 1;
                    cursor = Some(key);
                }
            }
        }

        debug!(
            "Evicted {} chunks, {} of {} resident bytes in use",
            evicted,
            self.allocator.used_bytes(),
            self.allocator.capacity_bytes()
        );
        Ok(evicted)
    }

    fn num_swapped(&self) -> usize {
        self.swapped
    }

    fn chunk_count(&self) -> usize {
        self.directory.len()
    }

    fn references(&self) -> Vec<ChunkReference> {
        self.directory.references()
    }

    fn stats(&self, category: StatsCategory) -> StatsReport {
        match category {
            StatsCategory::Summary => StatsReport::Summary(self.summary()),
            StatsCategory::RegionHistogram => StatsReport::RegionHistogram(Histogram::from_values(
                "Chart number of regions (y) vs. references (x)",
                &self.region_values(|_| 1),
            )),
            StatsCategory::PagingHistogram => StatsReport::PagingHistogram(Histogram::from_values(
                "Chart pages in/out (y) vs. references (x)",
                &self.counters.paging_histogram,
            )),
            StatsCategory::FreeSpaceHistogram => {
                StatsReport::FreeSpaceHistogram(Histogram::from_values(
                    "Chart region free space (y) vs. references (x)",
                    &self.region_values(|r| r.free_bytes()),
                ))
            }
            StatsCategory::Regions => StatsReport::Regions {
                regions: self
                    .allocator
                    .regions()
                    .iter()
                    .map(|r| RegionStats {
                        region: r.id(),
                        used: r.used_count(),
                        free_extents: r.free_count() as u64,
                        free_bytes: r.free_bytes(),
                        largest_free: r.largest_free(),
                        average_derefs: r.average_derefs(),
                    })
                    .collect(),
            },
            StatsCategory::Paging => StatsReport::Paging {
                page_out: self.counters.page_out,
                page_in: self.counters.page_in,
            },
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.swap.flush()?;
        Ok(())
    }

    fn fork_prepare(&mut self) -> Result<()> {
        let child = self.swap.clone_for_child()?;
        info!(
            "Cloned swap for fork: {} swapped chunks in {}",
            self.swapped,
            child.path().display()
        );
        self.child_swap_path = Some(child.path().to_path_buf());
        self.child_swap = Some(child);
        Ok(())
    }

    fn fork_parent(&mut self) -> Result<()> {
        // The child keeps its own descriptor for the clone
        self.child_swap = None;
        self.swap.rewind()?;
        Ok(())
    }

    fn into_fork_child(self: Box<Self>) -> Result<Box<dyn FrozenChunks>> {
        let PagingEngine {
            directory,
            allocator,
            child_swap,
            verify_checksums,
            ..
        } = *self;

        let swap = child_swap.ok_or_else(|| {
            ChunkError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "swap clone missing; fork_prepare was not run",
            ))
        })?;

        Ok(Box::new(FrozenPaging {
            directory,
            allocator,
            swap,
            verify_checksums,
        }))
    }

    fn fork_done(&mut self) -> Result<()> {
        self.child_swap = None;
        if let Some(path) = self.child_swap_path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed swap clone {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let mut chunks = Vec::with_capacity(self.directory.len());
        for (reference, entry) in self.directory.iter() {
            let data = copy_chunk(
                &self.directory,
                &self.allocator,
                &self.swap,
                self.verify_checksums,
                reference,
            )?;
            chunks.push((reference, entry.derefs, data));
        }
        Ok(Snapshot::from_chunks(chunks))
    }
}

/// Paging store as seen by a forked child
///
/// Resident chunks come from the child's copy of the regions; swapped
/// chunks from the swap clone made before the fork.
#[derive(Debug)]
struct FrozenPaging {
    directory: ChunkDirectory<Location>,
    allocator: RegionAllocator,
    swap: SwapFile,
    verify_checksums: bool,
}

impl FrozenChunks for FrozenPaging {
    fn fetch(&self, reference: ChunkReference) -> Result<Vec<u8>> {
        copy_chunk(
            &self.directory,
            &self.allocator,
            &self.swap,
            self.verify_checksums,
            reference,
        )
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
