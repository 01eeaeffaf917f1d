//! Fork lifecycle for point-in-time dumps
//!
//! A dump forks the process: the child writes out a frozen view of every
//! chunk while the parent keeps serving (and mutating) the live store.
//! Swapped chunks are the hazard, since parent and child would otherwise
//! share one swap file. The protocol therefore clones the swap file before
//! the fork and hands the clone to the child:
//!
//! ```text
//!            prepare_for_fork            after_fork_in_parent
//!   Normal ───────────────────→ Prepared ─────────────────────→ ParentResumed
//!     ↑                            │  │                               │
//!     │         fork_done          │  │ after_fork_in_child           │
//!     └────────────────────────────┘  ↓                               │
//!     ↑                         ChildSnapshotting (ForkChild)         │
//!     │                  fork_done                                    │
//!     └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! While `Prepared`, nothing that could touch the swap file or move a
//! chunk is allowed.

use crate::error::{ChunkError, Result};
use crate::reference::ChunkReference;
use crate::snapshot::Snapshot;
use std::fmt;
use std::path::Path;
use tracing::{error, info};

/// Where the store is in the fork protocol
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForkState {
    #[default]
    Normal,
    Prepared,
    ParentResumed,
    ChildSnapshotting,
}

impl fmt::Display for ForkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForkState::Normal => "normal",
            ForkState::Prepared => "prepared for fork",
            ForkState::ParentResumed => "resumed in parent after fork",
            ForkState::ChildSnapshotting => "snapshotting in forked child",
        };
        f.write_str(name)
    }
}

/// Enforces the legal fork transitions
#[derive(Debug, Default)]
pub struct ForkCoordinator {
    state: ForkState,
}

impl ForkCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ForkState {
        self.state
    }

    /// Fail unless the current state is one of `allowed`
    pub fn require(&self, operation: &'static str, allowed: &[ForkState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            error!(
                "Fork protocol violation: {} attempted while {}",
                operation, self.state
            );
            Err(ChunkError::ForkProtocolViolation {
                operation,
                state: self.state,
            })
        }
    }

    /// Fail if `operation` could mutate the store in the current state
    pub fn check_mutation(&self, operation: &'static str) -> Result<()> {
        self.require(
            operation,
            &[ForkState::Normal, ForkState::ParentResumed],
        )
    }

    /// Move to `next`; callers validate with [`require`](Self::require) first
    pub fn enter(&mut self, next: ForkState) {
        info!("Fork state: {} -> {}", self.state, next);
        self.state = next;
    }
}

/// Read-only access to a frozen set of chunks
///
/// Implemented by the engines' frozen forms and by [`Snapshot`]. None of
/// the methods update deref counters or move data.
pub trait FrozenChunks: Send {
    /// Payload of a chunk
    fn fetch(&self, reference: ChunkReference) -> Result<Vec<u8>>;

    /// Payload length of a chunk
    fn length(&self, reference: ChunkReference) -> Result<u16>;

    /// Deref counter of a chunk as it was frozen
    fn deref_count(&self, reference: ChunkReference) -> Result<u8>;

    /// Every chunk in the frozen view, in ascending handle order
    fn references(&self) -> Vec<ChunkReference>;
}

/// The store as seen by a forked child
///
/// Only reads are possible; the type has no mutating methods. Swapped
/// chunks are served from the child's private copy of the swap file.
pub struct ForkChild {
    chunks: Box<dyn FrozenChunks>,
}

impl fmt::Debug for ForkChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkChild")
            .field("chunks", &self.chunks.references().len())
            .finish()
    }
}

impl ForkChild {
    pub(crate) fn new(chunks: Box<dyn FrozenChunks>) -> Self {
        ForkChild { chunks }
    }

    pub fn state(&self) -> ForkState {
        ForkState::ChildSnapshotting
    }

    /// Copy a chunk into `buffer`, returning its true length
    ///
    /// The buffer is left untouched when it is too small.
    pub fn fetch(&self, reference: ChunkReference, buffer: &mut [u8]) -> Result<usize> {
        if reference.is_null() {
            return Ok(0);
        }
        let data = self.chunks.fetch(reference)?;
        if data.len() <= buffer.len() {
            buffer[..data.len()].copy_from_slice(&data);
        }
        Ok(data.len())
    }

    pub fn fetch_vec(&self, reference: ChunkReference) -> Result<Vec<u8>> {
        if reference.is_null() {
            return Ok(Vec::new());
        }
        self.chunks.fetch(reference)
    }

    pub fn length(&self, reference: ChunkReference) -> Result<u16> {
        if reference.is_null() {
            return Ok(0);
        }
        self.chunks.length(reference)
    }

    pub fn deref_count(&self, reference: ChunkReference) -> Result<u8> {
        if reference.is_null() {
            return Ok(0);
        }
        self.chunks.deref_count(reference)
    }

    pub fn references(&self) -> Vec<ChunkReference> {
        self.chunks.references()
    }

    /// Materialise the frozen view
    pub fn to_snapshot(&self) -> Result<Snapshot> {
        Snapshot::capture(self.chunks.as_ref())
    }

    /// Write the frozen view to `dir`; returns the bytes written
    pub fn export<P: AsRef<Path>>(&self, dir: P) -> Result<u64> {
        self.to_snapshot()?.write_to(dir)
    }
}

/// Which side of a [`ChunkStore::fork`](crate::ChunkStore::fork) we are on
///
/// The parent's store has already been resumed. The child's store is still
/// prepared; call [`ChunkStore::after_fork_in_child`](crate::ChunkStore::after_fork_in_child)
/// to turn it into a [`ForkChild`].
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    Parent { child_pid: libc::pid_t },
    Child,
}
