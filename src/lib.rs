//! # Chunk Store - Attribute Storage with Paging
//!
//! `chunk-store` keeps many small, variable-length binary values (attribute
//! text, scripts, descriptions) behind stable 32-bit handles. Chunks live
//! packed in fixed-size memory regions; when resident memory runs short the
//! least recently dereferenced chunks are paged out to a swap file and
//! brought back transparently on the next fetch.
//!
//! - **Stable handles**: a [`ChunkReference`] never changes while its chunk
//!   lives, whatever the store does with the bytes
//! - **Deref-driven paging**: per-chunk access counters, halved each period,
//!   decide what gets swapped
//! - **Fork-safe dumps**: a forked child gets a frozen view with its own copy
//!   of the swap file, or an in-process [`Snapshot`] can be exported instead
//! - **Statistics**: summaries, per-region tables and deref histograms
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chunk_store::{ChunkStore, Result, StoreConfig};
//!
//! # fn main() -> Result<()> {
//! let mut store = ChunkStore::new(StoreConfig::default())?;
//!
//! let desc = store.create(b"You see a rusty iron gate.", 0)?;
//! let mut buffer = [0u8; 64];
//! let len = store.fetch(desc, &mut buffer)?;
//! assert_eq!(&buffer[..len], b"You see a rusty iron gate.");
//!
//! // Once per aging period (e.g. hourly)
//! store.new_period()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Dumping
//!
//! ```rust,no_run
//! use chunk_store::{ChunkStoreBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let mut store = ChunkStoreBuilder::new().swap_path("/var/tmp/world.swap").build()?;
//! store.create(b"persisted", 0)?;
//!
//! // Without forking: copy everything, then write it out from any thread
//! let snapshot = store.snapshot()?;
//! snapshot.write_to("/var/tmp/dump")?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod fork;
pub mod record;
pub mod reference;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod swap;

pub use config::{EngineKind, StoreConfig};
pub use error::{ChunkError, Result};
#[cfg(unix)]
pub use fork::ForkOutcome;
pub use fork::{ForkChild, ForkState, FrozenChunks};
pub use reference::{ChunkReference, NULL_CHUNK_REFERENCE};
pub use snapshot::{Snapshot, SnapshotMetadata};
pub use stats::{StatsCategory, StatsReport};
pub use store::{ChunkStore, ChunkStoreBuilder};
