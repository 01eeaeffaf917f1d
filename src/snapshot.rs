//! Explicit point-in-time copies of a store
//!
//! A [`Snapshot`] owns a copy of every chunk, so it can be handed to an
//! export thread while the store keeps changing. It is the portable
//! alternative to a forked dump and is also what a forked child writes out.
//!
//! On disk a snapshot is a directory:
//!
//! ```text
//! <dir>/metadata.json   SnapshotMetadata
//! <dir>/chunks.bin      count: u64, then per chunk: reference: u32 | swap record
//! ```

use crate::error::{ChunkError, Result};
use crate::fork::FrozenChunks;
use crate::record::{self, RecordHeader, SWAP_HEADER_LEN};
use crate::reference::ChunkReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const METADATA_FILE: &str = "metadata.json";
const CHUNKS_FILE: &str = "chunks.bin";

/// Description of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Capture time (Unix microseconds)
    pub created_at: u64,
    /// Number of chunks
    pub chunk_count: u64,
    /// Sum of all payload lengths
    pub payload_bytes: u64,
}

#[derive(Debug, Clone)]
struct FrozenChunk {
    derefs: u8,
    data: Box<[u8]>,
}

/// Immutable copy of every chunk in a store
#[derive(Debug, Clone)]
pub struct Snapshot {
    metadata: SnapshotMetadata,
    chunks: BTreeMap<ChunkReference, FrozenChunk>,
}

impl Snapshot {
    /// Copy every chunk of a frozen view
    pub fn capture(source: &dyn FrozenChunks) -> Result<Self> {
        let mut chunks = Vec::new();
        for reference in source.references() {
            let derefs = source.deref_count(reference)?;
            let data = source.fetch(reference)?;
            chunks.push((reference, derefs, data));
        }
        Ok(Self::from_chunks(chunks))
    }

    pub(crate) fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = (ChunkReference, u8, Vec<u8>)>,
    {
        let chunks: BTreeMap<_, _> = chunks
            .into_iter()
            .map(|(reference, derefs, data)| {
                (
                    reference,
                    FrozenChunk {
                        derefs,
                        data: data.into_boxed_slice(),
                    },
                )
            })
            .collect();

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        Snapshot {
            metadata: SnapshotMetadata {
                created_at,
                chunk_count: chunks.len() as u64,
                payload_bytes: chunks.values().map(|c| c.data.len() as u64).sum(),
            },
            chunks,
        }
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Payload of a chunk, if it was part of the snapshot
    pub fn get(&self, reference: ChunkReference) -> Option<&[u8]> {
        self.chunks.get(&reference).map(|c| &*c.data)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks in ascending handle order
    pub fn iter(&self) -> impl Iterator<Item = (ChunkReference, &[u8])> {
        self.chunks.iter().map(|(r, c)| (*r, &*c.data))
    }

    /// Write the snapshot into `dir`, creating it if needed
    ///
    /// Returns the number of bytes written to the chunk file.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<u64> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let metadata_json = serde_json::to_string_pretty(&self.metadata)?;
        fs::write(dir.join(METADATA_FILE), metadata_json)?;

        let mut out = BufWriter::new(fs::File::create(dir.join(CHUNKS_FILE))?);
        out.write_all(&(self.chunks.len() as u64).to_le_bytes())?;
        let mut written = 8u64;
        for (reference, chunk) in &self.chunks {
            let record = record::encode_record(&chunk.data, chunk.derefs);
            out.write_all(&reference.into_raw().to_le_bytes())?;
            out.write_all(&record)?;
            written += 4 + record.len() as u64;
        }
        out.flush()?;

        info!(
            "Wrote snapshot of {} chunks ({} bytes) to {}",
            self.chunks.len(),
            written,
            dir.display()
        );
        Ok(written)
    }

    /// Load a snapshot previously written with [`write_to`](Self::write_to)
    pub fn read_from<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let metadata: SnapshotMetadata =
            serde_json::from_str(&fs::read_to_string(dir.join(METADATA_FILE))?)?;
        let bytes = fs::read(dir.join(CHUNKS_FILE))?;

        let count_bytes: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| truncated("chunk count"))?;
        let count = u64::from_le_bytes(count_bytes);

        let mut chunks = BTreeMap::new();
        let mut pos = 8usize;
        for _ in 0..count {
            let raw: [u8; 4] = bytes
                .get(pos..pos + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| truncated("chunk reference"))?;
            pos += 4;

            let header = RecordHeader::from_bytes(bytes.get(pos..).unwrap_or(&[]))?;
            let end = pos + SWAP_HEADER_LEN + header.len as usize;
            let data = bytes
                .get(pos + SWAP_HEADER_LEN..end)
                .ok_or_else(|| truncated("chunk payload"))?;
            pos = end;

            chunks.insert(
                ChunkReference::from_raw(u32::from_le_bytes(raw)),
                FrozenChunk {
                    derefs: header.derefs,
                    data: data.into(),
                },
            );
        }

        if chunks.len() as u64 != metadata.chunk_count {
            return Err(ChunkError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "snapshot holds {} chunks, metadata announces {}",
                    chunks.len(),
                    metadata.chunk_count
                ),
            )));
        }

        Ok(Snapshot { metadata, chunks })
    }
}

fn truncated(what: &str) -> ChunkError {
    ChunkError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("snapshot truncated while reading {}", what),
    ))
}

impl FrozenChunks for Snapshot {
    fn fetch(&self, reference: ChunkReference) -> Result<Vec<u8>> {
        self.get(reference)
            .map(<[u8]>::to_vec)
            .ok_or(ChunkError::InvalidReference(reference))
    }

    fn length(&self, reference: ChunkReference) -> Result<u16> {
        self.get(reference)
            .map(|data| data.len() as u16)
            .ok_or(ChunkError::InvalidReference(reference))
    }

    fn deref_count(&self, reference: ChunkReference) -> Result<u8> {
        self.chunks
            .get(&reference)
            .map(|c| c.derefs)
            .ok_or(ChunkError::InvalidReference(reference))
    }

    fn references(&self) -> Vec<ChunkReference> {
        self.chunks.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        Snapshot::from_chunks(vec![
            (ChunkReference::from_raw(2), 9, b"second".to_vec()),
            (ChunkReference::from_raw(1), 0, b"first".to_vec()),
            (ChunkReference::from_raw(3), 255, Vec::new()),
        ])
    }

    #[test]
    fn test_lookup_and_order() {
        let snap = sample();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.metadata().payload_bytes, 11);
        assert_eq!(snap.get(ChunkReference::from_raw(1)), Some(&b"first"[..]));
        assert_eq!(snap.get(ChunkReference::from_raw(4)), None);
        let refs: Vec<u32> = snap.references().iter().map(|r| r.into_raw()).collect();
        assert_eq!(refs, vec![1, 2, 3]);
        assert_eq!(snap.deref_count(ChunkReference::from_raw(3)).unwrap(), 255);
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let snap = sample();
        let written = snap.write_to(dir.path().join("dump")).unwrap();
        // count + 3 × (reference + header) + payload
        assert_eq!(written, 8 + 3 * (4 + 5) + 11);

        let loaded = Snapshot::read_from(dir.path().join("dump")).unwrap();
        assert_eq!(loaded.metadata(), snap.metadata());
        for (reference, data) in snap.iter() {
            assert_eq!(loaded.get(reference), Some(data));
            assert_eq!(
                loaded.deref_count(reference).unwrap(),
                snap.deref_count(reference).unwrap()
            );
        }
    }

    #[test]
    fn test_truncated_chunk_file_rejected() {
        let dir = TempDir::new().unwrap();
        sample().write_to(dir.path()).unwrap();
        let path = dir.path().join(CHUNKS_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&path, bytes).unwrap();

        assert!(Snapshot::read_from(dir.path()).is_err());
    }
}
