//! Free-extent bookkeeping with automatic coalescing
//!
//! Used both for the free space inside a region and for the free space in
//! the swap file. Offsets and lengths are in bytes.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A contiguous free byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if this extent contains a byte offset
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// Check if this extent is adjacent to another (can be coalesced)
    pub fn is_adjacent(&self, other: &Extent) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Coalesce two adjacent extents
    pub fn coalesce(&self, other: &Extent) -> Option<Extent> {
        if !self.is_adjacent(other) {
            return None;
        }

        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Some(Extent::new(start, end - start))
    }
}

/// Free extents of a fixed or growable address space
///
/// Free extents are indexed by start offset so neighbours are found with a
/// range query when space is released, and by `(length, start)` so best-fit
/// and largest-extent queries are logarithmic.
#[derive(Debug, Clone)]
pub struct ExtentMap {
    free: BTreeMap<u64, Extent>,
    by_size: BTreeSet<(u64, u64)>,
    capacity: u64,
    free_bytes: u64,
}

impl ExtentMap {
    /// Create a map where the whole `capacity` is free
    pub fn new(capacity: u64) -> Self {
        let mut map = ExtentMap {
            free: BTreeMap::new(),
            by_size: BTreeSet::new(),
            capacity,
            free_bytes: capacity,
        };
        if capacity > 0 {
            map.insert_extent(Extent::new(0, capacity));
        }
        map
    }

    fn insert_extent(&mut self, extent: Extent) {
        self.free.insert(extent.start, extent);
        self.by_size.insert((extent.length, extent.start));
    }

    fn remove_extent(&mut self, start: u64) -> Option<Extent> {
        let extent = self.free.remove(&start)?;
        self.by_size.remove(&(extent.length, extent.start));
        Some(extent)
    }

    /// Reserve `length` bytes from the smallest extent that fits
    ///
    /// Ties go to the lowest offset.
    pub fn allocate(&mut self, length: u64) -> Option<u64> {
        if length == 0 || length > self.free_bytes {
            return None;
        }

        let &(_, start) = self.by_size.range((length, 0)..).next()?;
        let best = self.free.get(&start).copied()?;

        self.take_from(best, best.start, length);
        Some(best.start)
    }

    /// Lowest free offset below `limit` that can hold `length` bytes
    pub fn lowest_fit(&self, length: u64, limit: u64) -> Option<u64> {
        self.free
            .range(..limit)
            .map(|(_, extent)| extent)
            .find(|extent| extent.length >= length)
            .map(|extent| extent.start)
    }

    /// The free extent that ends exactly at `end`, if any
    pub fn extent_ending_at(&self, end: u64) -> Option<Extent> {
        self.free
            .range(..end)
            .next_back()
            .map(|(_, extent)| *extent)
            .filter(|extent| extent.end() == end)
    }

    /// Reserve exactly `[start, start + length)`, which must lie inside one free extent
    pub fn allocate_at(&mut self, start: u64, length: u64) -> bool {
        let containing = self
            .free
            .range(..=start)
            .next_back()
            .map(|(_, extent)| *extent)
            .filter(|extent| extent.contains(start) && start + length <= extent.end());

        match containing {
            Some(extent) if length > 0 => {
                self.take_from(extent, start, length);
                true
            }
            _ => false,
        }
    }

    fn take_from(&mut self, extent: Extent, start: u64, length: u64) {
        self.remove_extent(extent.start);
        if start > extent.start {
            self.insert_extent(Extent::new(extent.start, start - extent.start));
        }
        let tail = start + length;
        if tail < extent.end() {
            self.insert_extent(Extent::new(tail, extent.end() - tail));
        }
        self.free_bytes -= length;
    }

    /// Release `[start, start + length)` and merge it with free neighbours
    pub fn free(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        debug_assert!(start + length <= self.capacity);

        let mut extent = Extent::new(start, length);

        if let Some((&prev_start, &prev)) = self.free.range(..start).next_back() {
            if let Some(merged) = prev.coalesce(&extent) {
                extent = merged;
                self.remove_extent(prev_start);
            }
        }

        if let Some((&next_start, &next)) = self.free.range(extent.end()..).next() {
            if let Some(merged) = extent.coalesce(&next) {
                extent = merged;
                self.remove_extent(next_start);
            }
        }

        self.insert_extent(extent);
        self.free_bytes += length;
    }

    /// Extend the address space; the new tail is free
    pub fn grow(&mut self, new_capacity: u64) {
        if new_capacity <= self.capacity {
            return;
        }
        let added = new_capacity - self.capacity;
        let start = self.capacity;
        self.capacity = new_capacity;
        // `free` adds `added` back to free_bytes
        self.free(start, added);
    }

    /// Length of the largest free extent
    pub fn largest(&self) -> u64 {
        self.by_size.last().map_or(0, |&(length, _)| length)
    }

    /// Free bytes that are not part of the largest free extent
    pub fn fragmented_bytes(&self) -> u64 {
        self.free_bytes - self.largest()
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.capacity - self.free_bytes
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of free extents (fragmentation indicator)
    pub fn extent_count(&self) -> usize {
        self.free.len()
    }

    /// End of the last allocated byte (0 when everything is free)
    pub fn high_water(&self) -> u64 {
        match self.free.values().next_back() {
            Some(last) if last.end() == self.capacity => last.start,
            _ => self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_adjacency() {
        let e1 = Extent::new(10, 10);
        let e2 = Extent::new(20, 10);
        let e3 = Extent::new(30, 10);

        assert!(e1.is_adjacent(&e2));
        assert!(e2.is_adjacent(&e1));
        assert!(!e1.is_adjacent(&e3));
        assert_eq!(e1.coalesce(&e2), Some(Extent::new(10, 20)));
        assert_eq!(e1.coalesce(&e3), None);
    }

    #[test]
    fn test_best_fit() {
        let mut map = ExtentMap::new(100);
        let a = map.allocate(10).unwrap();
        let b = map.allocate(20).unwrap();
        let c = map.allocate(10).unwrap();
        assert_eq!((a, b, c), (0, 10, 30));

        // Hole of 20 at 10, tail of 60 at 40
        map.free(b, 20);
        assert_eq!(map.allocate(15), Some(10));
        assert_eq!(map.free_bytes(), 100 - 10 - 15 - 10);
    }

    #[test]
    fn test_coalescing() {
        let mut map = ExtentMap::new(64);
        let offsets: Vec<u64> = (0..4).map(|_| map.allocate(16).unwrap()).collect();
        assert_eq!(map.free_bytes(), 0);
        assert_eq!(map.extent_count(), 0);

        map.free(offsets[0], 16);
        map.free(offsets[2], 16);
        assert_eq!(map.extent_count(), 2);
        assert_eq!(map.fragmented_bytes(), 16);

        map.free(offsets[1], 16);
        assert_eq!(map.extent_count(), 1);
        assert_eq!(map.largest(), 48);

        map.free(offsets[3], 16);
        assert_eq!(map.extent_count(), 1);
        assert_eq!(map.largest(), 64);
        assert_eq!(map.fragmented_bytes(), 0);
    }

    #[test]
    fn test_allocate_at_splits() {
        let mut map = ExtentMap::new(100);
        assert!(map.allocate_at(40, 20));
        assert_eq!(map.extent_ending_at(40), Some(Extent::new(0, 40)));
        assert_eq!(map.free_bytes(), 80);
        assert!(!map.allocate_at(50, 4));
        assert_eq!(map.extent_count(), 2);
        assert_eq!(map.lowest_fit(30, 100), Some(0));
        assert_eq!(map.lowest_fit(41, 100), None);
    }

    #[test]
    fn test_grow_merges_tail() {
        let mut map = ExtentMap::new(0);
        assert_eq!(map.allocate(1), None);
        map.grow(32);
        assert_eq!(map.allocate(32), Some(0));
        map.grow(64);
        assert_eq!(map.extent_count(), 1);
        assert_eq!(map.high_water(), 32);
        assert_eq!(map.allocate(32), Some(32));
        assert_eq!(map.high_water(), 64);
    }

    #[test]
    fn test_size_index_tracks_fragments() {
        let mut map = ExtentMap::new(1024);
        let offsets: Vec<u64> = (0..64).map(|_| map.allocate(16).unwrap()).collect();

        // Holes of 16, 32 and 48 bytes, plus a second 16 byte hole
        map.free(offsets[2], 16);
        map.free(offsets[10], 16);
        map.free(offsets[11], 16);
        map.free(offsets[20], 16);
        map.free(offsets[21], 16);
        map.free(offsets[22], 16);
        map.free(offsets[40], 16);
        assert_eq!(map.extent_count(), 4);
        assert_eq!(map.largest(), 48);

        // Best fit, lowest offset on ties
        assert_eq!(map.allocate(16), Some(offsets[2]));
        assert_eq!(map.allocate(16), Some(offsets[40]));
        assert_eq!(map.allocate(20), Some(offsets[10]));
        assert_eq!(map.largest(), 48);
        assert_eq!(map.allocate(48), Some(offsets[20]));
        assert_eq!(map.largest(), 12);
        assert_eq!(map.allocate(13), None);

        map.free(offsets[20], 48);
        map.free(offsets[19], 16);
        assert_eq!(map.largest(), 64);
        assert_eq!(map.extent_ending_at(offsets[23]), Some(Extent::new(offsets[19], 64)));
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let mut map = ExtentMap::new(16);
        assert_eq!(map.allocate(0), None);
        assert!(!map.allocate_at(0, 0));
        map.free(0, 0);
        assert_eq!(map.free_bytes(), 16);
    }
}
