//! Resident slot and swap record layouts
//!
//! ```text
//! Resident slot (inside a region, 4-byte aligned):
//! ┌──────────────┬────────────────┬──────────────────────┐
//! │ length: u16  │ reserved: u16  │ payload: length bytes │
//! └──────────────┴────────────────┴──────────────────────┘
//!
//! Swap record (inside the swap file):
//! ┌──────────────┬────────────────┬────────────┬──────────────────────┐
//! │ length: u16  │ reserved: u16  │ derefs: u8 │ payload: length bytes │
//! └──────────────┴────────────────┴────────────┴──────────────────────┘
//! ```
//!
//! All integers are little-endian and the reserved field is always zero.
//! A swap record is the resident slot with the derefs byte spliced in after
//! the header, so eviction and promotion never re-encode the payload.

use std::io;

/// Bytes in front of the payload of a resident slot
pub const RESIDENT_HEADER_LEN: usize = 4;

/// Bytes in front of the payload of a swap record
pub const SWAP_HEADER_LEN: usize = 5;

/// Largest payload a chunk can carry
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Slot alignment inside a region
pub const SLOT_ALIGN: usize = 4;

/// Size of the region slot needed for a payload of `len` bytes
pub fn slot_len(len: usize) -> usize {
    (RESIDENT_HEADER_LEN + len + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// Size of the swap record for a payload of `len` bytes
pub fn record_len(len: usize) -> usize {
    SWAP_HEADER_LEN + len
}

/// Write the resident header and payload into `slot`
///
/// `slot` must be at least `RESIDENT_HEADER_LEN + data.len()` bytes.
pub fn write_resident(slot: &mut [u8], data: &[u8]) {
    let len = data.len() as u16;
    slot[0..2].copy_from_slice(&len.to_le_bytes());
    slot[2..4].copy_from_slice(&[0, 0]);
    slot[RESIDENT_HEADER_LEN..RESIDENT_HEADER_LEN + data.len()].copy_from_slice(data);
}

/// Length stored in a resident slot header
pub fn resident_len(slot: &[u8]) -> u16 {
    u16::from_le_bytes([slot[0], slot[1]])
}

/// Payload of a resident slot
pub fn resident_payload(slot: &[u8]) -> &[u8] {
    let len = resident_len(slot) as usize;
    &slot[RESIDENT_HEADER_LEN..RESIDENT_HEADER_LEN + len]
}

/// Header of a swap record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub len: u16,
    pub derefs: u8,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; SWAP_HEADER_LEN] {
        let len = self.len.to_le_bytes();
        [len[0], len[1], 0, 0, self.derefs]
    }

    /// Parse a record header, rejecting a non-zero reserved field
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < SWAP_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("swap record header truncated to {} bytes", bytes.len()),
            ));
        }
        if bytes[2] != 0 || bytes[3] != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "swap record reserved field is not zero",
            ));
        }
        Ok(RecordHeader {
            len: u16::from_le_bytes([bytes[0], bytes[1]]),
            derefs: bytes[4],
        })
    }
}

/// Build a swap record from a resident slot and the chunk's deref count
pub fn record_from_slot(slot: &[u8], derefs: u8) -> Vec<u8> {
    let payload = resident_payload(slot);
    let mut record = Vec::with_capacity(record_len(payload.len()));
    record.extend_from_slice(&slot[..RESIDENT_HEADER_LEN]);
    record.push(derefs);
    record.extend_from_slice(payload);
    record
}

/// Build a swap record straight from payload bytes
pub fn encode_record(data: &[u8], derefs: u8) -> Vec<u8> {
    let header = RecordHeader {
        len: data.len() as u16,
        derefs,
    };
    let mut record = Vec::with_capacity(record_len(data.len()));
    record.extend_from_slice(&header.to_bytes());
    record.extend_from_slice(data);
    record
}

/// Split a swap record into its header and payload, checking the length
pub fn decode_record(record: &[u8]) -> io::Result<(RecordHeader, &[u8])> {
    let header = RecordHeader::from_bytes(record)?;
    let end = SWAP_HEADER_LEN + header.len as usize;
    if record.len() != end {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "swap record holds {} bytes, header announces {}",
                record.len(),
                end
            ),
        ));
    }
    Ok((header, &record[SWAP_HEADER_LEN..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_len_alignment() {
        assert_eq!(slot_len(0), 4);
        assert_eq!(slot_len(1), 8);
        assert_eq!(slot_len(4), 8);
        assert_eq!(slot_len(5), 12);
        assert_eq!(slot_len(MAX_CHUNK_LEN), 65540);
    }

    #[test]
    fn test_resident_layout() {
        let mut slot = vec![0xffu8; slot_len(5)];
        write_resident(&mut slot, b"hello");
        assert_eq!(&slot[0..4], &[5, 0, 0, 0]);
        assert_eq!(resident_len(&slot), 5);
        assert_eq!(resident_payload(&slot), b"hello");
    }

    #[test]
    fn test_record_is_slot_plus_derefs() {
        let mut slot = vec![0u8; slot_len(3)];
        write_resident(&mut slot, b"abc");
        let record = record_from_slot(&slot, 42);
        assert_eq!(record, vec![3, 0, 0, 0, 42, b'a', b'b', b'c']);
        assert_eq!(record, encode_record(b"abc", 42));

        let (header, payload) = decode_record(&record).unwrap();
        assert_eq!(header, RecordHeader { len: 3, derefs: 42 });
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_reserved_must_be_zero() {
        let mut record = encode_record(b"x", 0);
        record[3] = 1;
        let err = decode_record(&record).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut record = encode_record(b"xyz", 0);
        record.pop();
        assert!(decode_record(&record).is_err());
        assert!(RecordHeader::from_bytes(&[1, 0]).is_err());
    }
}
