//! Swap manager building blocks
//!
//! - [`SwapFile`]: the on-disk home of evicted chunk records
//! - [`ColdIndex`]: resident chunks ordered coldest first
//!
//! Eviction order is "lowest deref count, then least recently accessed".
//! The index key encodes exactly that order, so the coldest chunk is always
//! the first entry of the set.

pub mod file;

pub use file::SwapFile;

use crate::reference::ChunkReference;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Eviction priority of one resident chunk (smaller is colder)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColdKey {
    pub derefs: u8,
    pub last_access: u64,
    pub reference: ChunkReference,
}

impl ColdKey {
    pub fn new(derefs: u8, last_access: u64, reference: ChunkReference) -> Self {
        ColdKey {
            derefs,
            last_access,
            reference,
        }
    }
}

/// Resident chunks ordered by eviction priority
#[derive(Debug, Default, Clone)]
pub struct ColdIndex {
    keys: BTreeSet<ColdKey>,
}

impl ColdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ColdKey) {
        self.keys.insert(key);
    }

    pub fn remove(&mut self, key: &ColdKey) -> bool {
        self.keys.remove(key)
    }

    /// Replace `old` with `new` after a chunk was touched
    pub fn update(&mut self, old: &ColdKey, new: ColdKey) {
        self.keys.remove(old);
        self.keys.insert(new);
    }

    /// The coldest chunk
    pub fn coldest(&self) -> Option<ColdKey> {
        self.keys.first().copied()
    }

    /// The coldest chunk strictly warmer than `cursor`
    ///
    /// Eviction walks the index with this so a candidate that could not be
    /// written out is skipped rather than retried forever.
    pub fn next_after(&self, cursor: Option<ColdKey>) -> Option<ColdKey> {
        match cursor {
            None => self.coldest(),
            Some(cursor) => self
                .keys
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .next()
                .copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}
