//! A fixed-capacity memory region holding variable-length slots

use super::extent::ExtentMap;
use crate::record;

/// One arena of resident chunk slots
#[derive(Debug)]
pub struct Region {
    id: u32,
    bytes: Box<[u8]>,
    space: ExtentMap,
    used_count: u32,
    deref_sum: u64,
}

impl Region {
    pub(crate) fn new(id: u32, size: usize) -> Self {
        Region {
            id,
            bytes: vec![0u8; size].into_boxed_slice(),
            space: ExtentMap::new(size as u64),
            used_count: 0,
            deref_sum: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of occupied slots
    pub fn used_count(&self) -> u32 {
        self.used_count
    }

    /// Number of free extents
    pub fn free_count(&self) -> usize {
        self.space.extent_count()
    }

    pub fn free_bytes(&self) -> u64 {
        self.space.free_bytes()
    }

    pub fn used_bytes(&self) -> u64 {
        self.space.used_bytes()
    }

    pub fn largest_free(&self) -> u64 {
        self.space.largest()
    }

    /// Free bytes outside the largest free extent
    pub fn fragmented_bytes(&self) -> u64 {
        self.space.fragmented_bytes()
    }

    pub fn capacity(&self) -> u64 {
        self.space.capacity()
    }

    /// Average deref count of the chunks in this region
    pub fn average_derefs(&self) -> u8 {
        if self.used_count == 0 {
            0
        } else {
            (self.deref_sum / self.used_count as u64).min(u8::MAX as u64) as u8
        }
    }

    /// Average deref count if a chunk with `derefs` were added
    pub(crate) fn average_with(&self, derefs: u8) -> u64 {
        (self.deref_sum + derefs as u64) / (self.used_count as u64 + 1)
    }

    pub(crate) fn can_fit(&self, slot_len: usize) -> bool {
        self.space.largest() >= slot_len as u64
    }

    /// The whole slot (header and payload) at `offset`
    pub(crate) fn slot(&self, offset: u32) -> &[u8] {
        let start = offset as usize;
        let len = record::resident_len(&self.bytes[start..]) as usize;
        &self.bytes[start..start + record::slot_len(len)]
    }

    pub(crate) fn payload(&self, offset: u32) -> &[u8] {
        record::resident_payload(&self.bytes[offset as usize..])
    }

    /// Reserve a slot and write `data` into it
    pub(crate) fn insert(&mut self, data: &[u8], derefs: u8) -> Option<u32> {
        let need = record::slot_len(data.len());
        let offset = self.space.allocate(need as u64)?;
        self.write_at(offset as usize, data, derefs);
        Some(offset as u32)
    }

    /// Reserve the slot at exactly `offset` and write `data` into it
    pub(crate) fn insert_at(&mut self, offset: u32, data: &[u8], derefs: u8) -> bool {
        let need = record::slot_len(data.len());
        if !self.space.allocate_at(offset as u64, need as u64) {
            return false;
        }
        self.write_at(offset as usize, data, derefs);
        true
    }

    fn write_at(&mut self, offset: usize, data: &[u8], derefs: u8) {
        let need = record::slot_len(data.len());
        record::write_resident(&mut self.bytes[offset..offset + need], data);
        self.used_count += 1;
        self.deref_sum += derefs as u64;
    }

    /// Release the slot at `offset`
    pub(crate) fn remove(&mut self, offset: u32, derefs: u8) {
        let need = self.slot(offset).len();
        self.space.free(offset as u64, need as u64);
        self.used_count -= 1;
        self.deref_sum = self.deref_sum.saturating_sub(derefs as u64);
    }

    /// Move the slot at `offset` down into the free extent that ends right before it
    ///
    /// Returns the new offset, or `None` when the slot has no free space
    /// directly below it.
    pub(crate) fn slide_down(&mut self, offset: u32) -> Option<u32> {
        let need = self.slot(offset).len();
        let hole = self.space.extent_ending_at(offset as u64)?;

        let start = offset as usize;
        self.bytes.copy_within(start..start + need, hole.start as usize);
        self.space.free(offset as u64, need as u64);
        let reserved = self.space.allocate_at(hole.start, need as u64);
        debug_assert!(reserved);
        Some(hole.start as u32)
    }

    /// Lowest offset below `offset` where a slot of `need` bytes fits
    pub(crate) fn lower_fit(&self, need: usize, offset: u32) -> Option<u32> {
        self.space
            .lowest_fit(need as u64, offset as u64)
            .map(|o| o as u32)
    }

    pub(crate) fn add_derefs(&mut self, n: u64) {
        self.deref_sum += n;
    }

    pub(crate) fn reset_derefs(&mut self) {
        self.deref_sum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_read() {
        let mut region = Region::new(0, 256);
        let a = region.insert(b"hello", 3).unwrap();
        let b = region.insert(b"", 5).unwrap();
        assert_eq!(region.payload(a), b"hello");
        assert_eq!(region.payload(b), b"");
        assert_eq!(region.slot(a).len(), 12);
        assert_eq!(region.used_count(), 2);
        assert_eq!(region.average_derefs(), 4);
        assert_eq!(region.used_bytes(), 16);
    }

    #[test]
    fn test_remove_coalesces() {
        let mut region = Region::new(0, 64);
        let a = region.insert(&[1; 12], 0).unwrap();
        let b = region.insert(&[2; 12], 0).unwrap();
        let c = region.insert(&[3; 12], 0).unwrap();
        region.remove(b, 0);
        assert_eq!(region.free_count(), 2);
        region.remove(a, 0);
        region.remove(c, 0);
        assert_eq!(region.free_count(), 1);
        assert_eq!(region.largest_free(), 64);
        assert_eq!(region.used_count(), 0);
    }

    #[test]
    fn test_slide_down_into_adjacent_hole() {
        let mut region = Region::new(0, 64);
        let a = region.insert(&[1; 12], 0).unwrap();
        let b = region.insert(&[2; 12], 0).unwrap();
        region.remove(a, 0);
        let moved = region.slide_down(b).unwrap();
        assert_eq!(moved, 0);
        assert_eq!(region.payload(moved), &[2; 12]);
        assert_eq!(region.largest_free(), 48);
        assert_eq!(region.slide_down(moved), None);
    }

    #[test]
    fn test_slide_requires_adjacent_hole() {
        let mut region = Region::new(0, 64);
        let a = region.insert(&[1; 4], 0).unwrap();
        let _b = region.insert(&[2; 4], 0).unwrap();
        let c = region.insert(&[3; 4], 0).unwrap();
        region.remove(a, 0);
        // hole at 0 is not adjacent to c
        assert_eq!(region.slide_down(c), None);
        assert_eq!(region.lower_fit(8, c), Some(0));
    }
}
