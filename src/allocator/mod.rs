//! Region allocator for resident chunks
//!
//! Resident memory is a set of fixed-size regions. Each region is carved
//! into 4-byte aligned slots with a best-fit free-extent map:
//!
//! ```text
//! RegionAllocator (budget: max_regions × region_size)
//!   ├─→ Region 0  [slot|slot|free |slot|   free   ]  avg derefs 12
//!   ├─→ Region 1  [slot|slot|slot|slot|slot| free ]  avg derefs 200
//!   └─→ Region 2  [            free              ]   (recycled when empty)
//! ```
//!
//! Placement keeps chunks with similar deref counts together so that hot
//! regions stay hot and cold chunks cluster where the swap manager can
//! evict them cheaply.

pub mod extent;
pub mod region;

use crate::error::{ChunkError, Result};
use crate::record;
use region::Region;
use serde::Serialize;
use tracing::{debug, info};

/// Regions holding this many chunks or fewer are penalised as placement targets
const LONELINESS_LIMIT: u32 = 5;

/// Create a fresh region when total free space is below this percentage
const FREE_PERCENT_LIMIT: u64 = 2;

/// Score above which a fresh region is preferred (when free space is scarce)
const CREATE_REGION_SCORE: u64 = (1 << LONELINESS_LIMIT) + 4;

/// Physical position of a resident slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotLocation {
    pub region: u32,
    pub offset: u32,
}

/// How a migration moved a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    /// Shifted down into the free space directly below it
    Slide,
    /// Moved to a lower free extent in the same region
    Fill,
    /// Moved to a different region
    Away,
}

/// Allocator owning every resident chunk byte
#[derive(Debug)]
pub struct RegionAllocator {
    regions: Vec<Region>,
    region_size: usize,
    max_regions: usize,
}

impl RegionAllocator {
    /// Create an allocator that may grow to `max_regions` regions of `region_size` bytes
    pub fn new(region_size: usize, max_regions: usize) -> Self {
        RegionAllocator {
            regions: Vec::new(),
            region_size,
            max_regions: max_regions.max(1),
        }
    }

    /// Place `data` in the best region, creating one if needed and allowed
    ///
    /// Fails with `OutOfSpace` when no region has room and the region
    /// budget is exhausted; the caller is expected to evict and retry.
    pub fn store(&mut self, data: &[u8], derefs: u8) -> Result<SlotLocation> {
        let need = record::slot_len(data.len());
        if need > self.region_size {
            return Err(ChunkError::OutOfSpace {
                requested: data.len(),
            });
        }

        let index = self
            .choose_region(need, derefs, None)
            .ok_or(ChunkError::OutOfSpace {
                requested: data.len(),
            })?;
        let region = &mut self.regions[index];
        let offset = region
            .insert(data, derefs)
            .ok_or(ChunkError::OutOfSpace {
                requested: data.len(),
            })?;

        Ok(SlotLocation {
            region: region.id(),
            offset,
        })
    }

    /// Release a slot
    pub fn free(&mut self, location: SlotLocation, derefs: u8) {
        self.regions[location.region as usize].remove(location.offset, derefs);
    }

    /// Payload bytes of a resident chunk
    pub fn payload(&self, location: SlotLocation) -> &[u8] {
        self.regions[location.region as usize].payload(location.offset)
    }

    /// Header and payload bytes of a resident chunk
    pub fn slot(&self, location: SlotLocation) -> &[u8] {
        self.regions[location.region as usize].slot(location.offset)
    }

    /// Move a slot if that improves placement
    ///
    /// A slot moves to another region when that region's deref profile
    /// suits it better; otherwise it is compacted towards the start of its
    /// own region. Returns the new location and the kind of move.
    pub fn migrate(
        &mut self,
        location: SlotLocation,
        derefs: u8,
    ) -> Option<(SlotLocation, MoveKind)> {
        let need = self.slot(location).len();
        let best = self.choose_region(need, derefs, Some(location.region))?;

        if best != location.region as usize {
            return self
                .relocate(location, best, derefs)
                .map(|moved| (moved, MoveKind::Away));
        }

        let region = &mut self.regions[best];
        if let Some(offset) = region.slide_down(location.offset) {
            return Some((
                SlotLocation {
                    region: location.region,
                    offset,
                },
                MoveKind::Slide,
            ));
        }

        let lower = region.lower_fit(need, location.offset)?;
        let data = region.payload(location.offset).to_vec();
        if !region.insert_at(lower, &data, derefs) {
            return None;
        }
        region.remove(location.offset, derefs);
        Some((
            SlotLocation {
                region: location.region,
                offset: lower,
            },
            MoveKind::Fill,
        ))
    }

    /// Copy a slot into region `target`, then free the original
    ///
    /// The old slot is only released once the copy is in place, so a
    /// failed move leaves the chunk where it was.
    pub fn relocate(
        &mut self,
        location: SlotLocation,
        target: usize,
        derefs: u8,
    ) -> Option<SlotLocation> {
        let data = self.payload(location).to_vec();
        let region = self.regions.get_mut(target)?;
        let offset = region.insert(&data, derefs)?;
        let moved = SlotLocation {
            region: region.id(),
            offset,
        };
        self.free(location, derefs);
        Some(moved)
    }

    /// Pick the region with the lowest placement score
    ///
    /// `current` is the region a migrating chunk already lives in; it always
    /// qualifies and is scored by its existing average.
    fn choose_region(&mut self, need: usize, derefs: u8, current: Option<u32>) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        let mut free_bytes = 0u64;

        for (index, region) in self.regions.iter().enumerate() {
            free_bytes += region.free_bytes();
            let is_current = current == Some(region.id());
            if !is_current && !region.can_fit(need) {
                continue;
            }

            let average = if is_current {
                region.average_derefs() as u64
            } else {
                region.average_with(derefs)
            };
            let mut score = (derefs as u64).abs_diff(average);
            if region.used_count() <= LONELINESS_LIMIT {
                score += 1 << (LONELINESS_LIMIT - region.used_count());
            }

            if best.map_or(true, |(_, s)| score < s) {
                best = Some((index, score));
            }
        }

        match best {
            None => self.create_region(),
            Some((index, score)) => {
                let capacity = (self.region_size * self.regions.len()) as u64;
                let scarce = capacity > 0 && free_bytes * 100 / capacity < FREE_PERCENT_LIMIT;
                if score > CREATE_REGION_SCORE && scarce && current.is_none() {
                    if let Some(fresh) = self.create_region() {
                        return Some(fresh);
                    }
                }
                Some(index)
            }
        }
    }

    fn create_region(&mut self) -> Option<usize> {
        if self.regions.len() >= self.max_regions {
            return None;
        }
        let id = self.regions.len() as u32;
        self.regions.push(Region::new(id, self.region_size));
        info!(
            "Created region {} ({} of {} allowed)",
            id,
            self.regions.len(),
            self.max_regions
        );
        Some(id as usize)
    }

    /// Account for `n` more dereferences of a chunk in `region`
    pub fn add_derefs(&mut self, region: u32, n: u64) {
        self.regions[region as usize].add_derefs(n);
    }

    /// Zero every region's deref total (before re-adding aged counts)
    pub fn reset_derefs(&mut self) {
        for region in &mut self.regions {
            region.reset_derefs();
        }
        debug!("Reset deref totals on {} regions", self.regions.len());
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn max_regions(&self) -> usize {
        self.max_regions
    }

    /// Bytes of resident memory the allocator may use
    pub fn capacity_bytes(&self) -> u64 {
        (self.region_size * self.max_regions) as u64
    }

    /// Bytes occupied by resident slots
    pub fn used_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.used_bytes()).sum()
    }

    /// Free bytes in regions that currently exist
    pub fn free_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.free_bytes()).sum()
    }

    /// Free bytes outside each region's largest free extent
    pub fn fragmented_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.fragmented_bytes()).sum()
    }
}
