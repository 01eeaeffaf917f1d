//! Chunk directory: handle → location
//!
//! The directory is a dense arena of slots. A handle packs the slot index
//! and the slot's generation:
//!
//! ```text
//!  31        24 23                       0
//! +------------+--------------------------+
//! | generation |      slot index + 1      |
//! +------------+--------------------------+
//! ```
//!
//! The `+ 1` keeps every live handle distinct from the null reference. The
//! generation is bumped whenever a slot is vacated, so a handle that
//! outlives its chunk no longer matches and is reported as invalid. Vacant
//! slots are recycled oldest-first. A slot whose generation is used up is
//! retired rather than wrapped, so no handle value is ever issued twice.

use crate::error::{ChunkError, Result};
use crate::reference::ChunkReference;
use std::collections::VecDeque;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Generation of a slot's final tenant
const LAST_GENERATION: u8 = u8::MAX;

/// Most chunks that can be alive at once
pub const MAX_LIVE_CHUNKS: usize = INDEX_MASK as usize;

/// Bookkeeping for one live chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry<L> {
    /// Payload length in bytes
    pub len: u16,
    /// Access-priority counter
    pub derefs: u8,
    /// Logical time of the last access
    pub last_access: u64,
    /// Where the bytes live
    pub location: L,
}

#[derive(Debug, Clone)]
enum Slot<L> {
    Occupied {
        generation: u8,
        entry: DirectoryEntry<L>,
    },
    Vacant,
}

/// Arena of directory entries addressed by [`ChunkReference`]
#[derive(Debug, Clone)]
pub struct ChunkDirectory<L> {
    slots: Vec<Slot<L>>,
    /// Vacant slots with the generation their next occupant gets
    vacant: VecDeque<(u32, u8)>,
    live: usize,
}

fn encode(index: u32, generation: u8) -> ChunkReference {
    ChunkReference::from_raw(((generation as u32) << INDEX_BITS) | (index + 1))
}

fn decode(reference: ChunkReference) -> Option<(usize, u8)> {
    let raw = reference.into_raw();
    let low = raw & INDEX_MASK;
    if low == 0 {
        return None;
    }
    Some(((low - 1) as usize, (raw >> INDEX_BITS) as u8))
}

impl<L> Default for ChunkDirectory<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> ChunkDirectory<L> {
    pub fn new() -> Self {
        ChunkDirectory {
            slots: Vec::new(),
            vacant: VecDeque::new(),
            live: 0,
        }
    }

    /// Register a new chunk and hand out its reference
    pub fn insert(&mut self, entry: DirectoryEntry<L>) -> Result<ChunkReference> {
        let (index, generation) = match self.vacant.pop_front() {
            Some(vacant) => vacant,
            None => {
                if self.slots.len() >= MAX_LIVE_CHUNKS {
                    return Err(ChunkError::OutOfSpace {
                        requested: entry.len as usize,
                    });
                }
                self.slots.push(Slot::Vacant);
                ((self.slots.len() - 1) as u32, 0)
            }
        };

        self.slots[index as usize] = Slot::Occupied { generation, entry };
        self.live += 1;

        Ok(encode(index, generation))
    }

    /// Look up a live chunk
    pub fn get(&self, reference: ChunkReference) -> Result<&DirectoryEntry<L>> {
        match decode(reference).and_then(|(index, gen)| self.slots.get(index).map(|s| (s, gen))) {
            Some((Slot::Occupied { generation, entry }, gen)) if *generation == gen => Ok(entry),
            _ => Err(ChunkError::InvalidReference(reference)),
        }
    }

    /// Look up a live chunk for update
    pub fn get_mut(&mut self, reference: ChunkReference) -> Result<&mut DirectoryEntry<L>> {
        let found = decode(reference)
            .and_then(|(index, gen)| self.slots.get_mut(index).map(|s| (s, gen)));
        match found {
            Some((Slot::Occupied { generation, entry }, gen)) if *generation == gen => Ok(entry),
            _ => Err(ChunkError::InvalidReference(reference)),
        }
    }

    /// Forget a chunk; its reference becomes invalid
    pub fn remove(&mut self, reference: ChunkReference) -> Result<DirectoryEntry<L>> {
        self.get(reference)?;
        let (index, generation) =
            decode(reference).ok_or(ChunkError::InvalidReference(reference))?;

        match std::mem::replace(&mut self.slots[index], Slot::Vacant) {
            Slot::Occupied { entry, .. } => {
                if generation < LAST_GENERATION {
                    self.vacant.push_back((index as u32, generation + 1));
                }
                self.live -= 1;
                Ok(entry)
            }
            Slot::Vacant => Err(ChunkError::InvalidReference(reference)),
        }
    }

    /// Number of live chunks
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// References of every live chunk, in ascending handle order
    pub fn references(&self) -> Vec<ChunkReference> {
        let mut references: Vec<_> = self.iter().map(|(r, _)| r).collect();
        references.sort_unstable();
        references
    }

    /// Live chunks in slot order
    pub fn iter(&self) -> impl Iterator<Item = (ChunkReference, &DirectoryEntry<L>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, entry } => {
                    Some((encode(index as u32, *generation), entry))
                }
                Slot::Vacant => None,
            })
    }

    /// Live chunks in slot order, for in-place updates
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChunkReference, &mut DirectoryEntry<L>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, entry } => {
                    Some((encode(index as u32, *generation), entry))
                }
                Slot::Vacant => None,
            })
    }
}
