//! Opaque chunk handles
//!
//! A [`ChunkReference`] is what the attribute layer stores next to an
//! attribute name. It is a plain 32-bit value: cheap to copy, hash and
//! persist. Only the directory knows how the bits are laid out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle naming a stored chunk
///
/// The value `0` ([`NULL_CHUNK_REFERENCE`]) means "no chunk" and is never
/// returned by a successful create.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkReference(u32);

/// The reference that names no chunk
pub const NULL_CHUNK_REFERENCE: ChunkReference = ChunkReference(0);

impl ChunkReference {
    /// Rebuild a reference from a value previously obtained with [`into_raw`](Self::into_raw)
    pub const fn from_raw(raw: u32) -> Self {
        ChunkReference(raw)
    }

    /// The raw 32-bit value, for persisting alongside attribute metadata
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<ChunkReference> for u32 {
    fn from(reference: ChunkReference) -> Self {
        reference.0
    }
}

impl fmt::Display for ChunkReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{:08x}", self.0)
    }
}
