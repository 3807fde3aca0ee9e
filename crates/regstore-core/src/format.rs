//! Binary format of WAL records
//!
//! Every record is a fixed 16-byte header followed by its payload:
//!
//! ```text
//!   [0..4]   magic:       "RGWL"
//!   [4..8]   length:      u32 LE, payload bytes
//!   [8..12]  checksum:    u32 LE, CRC32C of payload
//!   [12]     record_type: u8 (1 = update, 2 = delete)
//!   [13..16] reserved:    zero
//! ```
//!
//! Update payload: parent commitment (32) + path width u16 + count u32, then
//! per register the path bytes, value length u32 and value. Delete payload:
//! the evicted commitment (32).

use std::path::PathBuf;

use crate::error::{LedgerError, LedgerResult};
use crate::hash::{Hash, HASH_LEN};
use crate::path::{Path, MAX_PATH_BYTES};
use crate::trie::StateCommitment;

/// Magic bytes identifying a record header
pub const MAGIC_ARRAY: [u8; 4] = *b"RGWL";

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A batch of writes applied to a parent trie
    Update = 1,
    /// A trie left the forest
    Delete = 2,
}

impl RecordType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordType::Update),
            2 => Some(RecordType::Delete),
            _ => None,
        }
    }
}

/// Fixed-size header in front of each record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub record_type: u8,
    pub reserved: [u8; 3],
}

impl RecordHeader {
    pub fn new(length: u32, checksum: u32, record_type: RecordType) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            record_type: record_type as u8,
            reserved: [0; 3],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.record_type;
        buf[13..16].copy_from_slice(&self.reserved);
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            record_type: bytes[12],
            reserved: [bytes[13], bytes[14], bytes[15]],
        }
    }

    /// Magic and reserved bytes look like a record we wrote.
    pub fn is_well_formed(&self) -> bool {
        self.magic == MAGIC_ARRAY
            && self.reserved == [0; 3]
            && RecordType::from_u8(self.record_type).is_some()
    }
}

/// A decoded WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Update {
        parent: StateCommitment,
        paths: Vec<Path>,
        values: Vec<Vec<u8>>,
    },
    Delete {
        commitment: StateCommitment,
    },
}

impl WalRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            WalRecord::Update { .. } => RecordType::Update,
            WalRecord::Delete { .. } => RecordType::Delete,
        }
    }
}

/// Serialize an update record. `path_width` is the trie height in bytes.
pub fn serialize_update(
    parent: &StateCommitment,
    path_width: usize,
    paths: &[Path],
    values: &[Vec<u8>],
) -> LedgerResult<Vec<u8>> {
    if paths.len() != values.len() {
        return Err(LedgerError::MismatchedLengths {
            paths: paths.len(),
            values: values.len(),
        });
    }
    let body: usize = values.iter().map(|v| path_width + 4 + v.len()).sum();
    let payload_size = HASH_LEN + 2 + 4 + body;
    if payload_size > u32::MAX as usize {
        return Err(LedgerError::OversizedValue {
            size: payload_size,
            max: u32::MAX as usize,
        });
    }

    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(parent.as_bytes());
    payload.extend_from_slice(&(path_width as u16).to_le_bytes());
    payload.extend_from_slice(&(paths.len() as u32).to_le_bytes());
    for (path, value) in paths.iter().zip(values) {
        payload.extend_from_slice(&path.as_bytes()[..path_width]);
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(value);
    }
    Ok(frame(RecordType::Update, payload))
}

/// Serialize a delete record.
pub fn serialize_delete(commitment: &StateCommitment) -> Vec<u8> {
    frame(RecordType::Delete, commitment.as_bytes().to_vec())
}

fn frame(record_type: RecordType, payload: Vec<u8>) -> Vec<u8> {
    let checksum = crc32c::crc32c(&payload);
    let header = RecordHeader::new(payload.len() as u32, checksum, record_type);
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(&payload);
    buffer
}

/// Decode a payload whose header and checksum were already verified.
pub fn decode_payload(record_type: RecordType, payload: &[u8]) -> Result<WalRecord, String> {
    match record_type {
        RecordType::Delete => {
            if payload.len() != HASH_LEN {
                return Err(format!("delete payload is {} bytes, expected {}", payload.len(), HASH_LEN));
            }
            let commitment = Hash::from_slice(payload).ok_or("bad commitment")?;
            Ok(WalRecord::Delete { commitment })
        }
        RecordType::Update => {
            if payload.len() < HASH_LEN + 6 {
                return Err("update payload too short for its fixed fields".to_string());
            }
            let parent = Hash::from_slice(&payload[..HASH_LEN]).ok_or("bad parent")?;
            let width = u16::from_le_bytes([payload[HASH_LEN], payload[HASH_LEN + 1]]) as usize;
            if width == 0 || width > MAX_PATH_BYTES {
                return Err(format!("invalid path width {}", width));
            }
            let count = u32::from_le_bytes([
                payload[HASH_LEN + 2],
                payload[HASH_LEN + 3],
                payload[HASH_LEN + 4],
                payload[HASH_LEN + 5],
            ]) as usize;

            let mut pos = HASH_LEN + 6;
            // each entry takes at least width + 4 bytes
            let mut paths = Vec::with_capacity(count.min((payload.len() - pos) / (width + 4)));
            let mut values = Vec::with_capacity(paths.capacity());
            for i in 0..count {
                if payload.len() < pos + width + 4 {
                    return Err(format!("entry {} truncated", i));
                }
                let path = Path::from_prefix(&payload[pos..pos + width]).ok_or("bad path")?;
                pos += width;
                let len = u32::from_le_bytes([payload[pos], payload[pos + 1], payload[pos + 2], payload[pos + 3]])
                    as usize;
                pos += 4;
                if payload.len() - pos < len {
                    return Err(format!("value of entry {} truncated", i));
                }
                values.push(payload[pos..pos + len].to_vec());
                pos += len;
                paths.push(path);
            }
            if pos != payload.len() {
                return Err(format!("{} trailing bytes after {} entries", payload.len() - pos, count));
            }
            Ok(WalRecord::Update { parent, paths, values })
        }
    }
}

/// Deserialize one complete record from the front of `data`.
///
/// Returns the record and the number of bytes it occupied.
pub fn deserialize_record(data: &[u8]) -> LedgerResult<(WalRecord, usize)> {
    let corrupted = |offset: u64, reason: String| LedgerError::WalCorrupted {
        path: PathBuf::from("<buffer>"),
        offset,
        reason,
    };

    if data.len() < HEADER_SIZE {
        return Err(corrupted(
            0,
            format!("record too short: {} bytes, need at least {}", data.len(), HEADER_SIZE),
        ));
    }
    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&header_bytes);
    if !header.is_well_formed() {
        return Err(corrupted(0, "bad record header".to_string()));
    }

    let end = HEADER_SIZE + header.length as usize;
    if data.len() < end {
        return Err(corrupted(
            HEADER_SIZE as u64,
            format!("payload needs {} bytes, {} available", header.length, data.len() - HEADER_SIZE),
        ));
    }
    let payload = &data[HEADER_SIZE..end];
    let actual = crc32c::crc32c(payload);
    if actual != header.checksum {
        return Err(LedgerError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected: header.checksum,
            actual,
            offset: HEADER_SIZE as u64,
        });
    }

    let record_type = RecordType::from_u8(header.record_type)
        .ok_or_else(|| corrupted(12, format!("unknown record type {}", header.record_type)))?;
    let record = decode_payload(record_type, payload).map_err(|reason| corrupted(HEADER_SIZE as u64, reason))?;
    Ok((record, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha3;

    fn path(b: u8) -> Path {
        Path::from_prefix(&[b; 32]).unwrap()
    }

    #[test]
    fn test_update_roundtrip() {
        let parent = sha3(b"parent");
        let paths = vec![path(1), path(2)];
        let values = vec![b"one".to_vec(), Vec::new()];

        let bytes = serialize_update(&parent, 32, &paths, &values).unwrap();
        let (record, used) = deserialize_record(&bytes).unwrap();

        assert_eq!(used, bytes.len());
        assert_eq!(record, WalRecord::Update { parent, paths, values });
    }

    #[test]
    fn test_short_path_width_zero_fills() {
        let paths = vec![Path::from_prefix(&[0xAB, 0xCD]).unwrap()];
        let bytes = serialize_update(&Hash::ZERO, 2, &paths, &[vec![7]]).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 32 + 2 + 4 + 2 + 4 + 1);
        let (record, _) = deserialize_record(&bytes).unwrap();
        match record {
            WalRecord::Update { paths: decoded, .. } => assert_eq!(decoded, paths),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_delete_roundtrip() {
        let c = sha3(b"gone");
        let bytes = serialize_delete(&c);
        assert_eq!(bytes.len(), HEADER_SIZE + HASH_LEN);
        assert_eq!(deserialize_record(&bytes).unwrap().0, WalRecord::Delete { commitment: c });
    }

    #[test]
    fn test_mismatched_batch_rejected() {
        let result = serialize_update(&Hash::ZERO, 32, &[path(1)], &[]);
        assert!(matches!(result, Err(LedgerError::MismatchedLengths { paths: 1, values: 0 })));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = serialize_delete(&sha3(b"x"));
        data[0] = 0xFF;
        assert!(matches!(deserialize_record(&data), Err(LedgerError::WalCorrupted { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = serialize_update(&Hash::ZERO, 32, &[path(3)], &[b"value".to_vec()]).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(deserialize_record(&data), Err(LedgerError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_torn_record_detected() {
        let data = serialize_update(&Hash::ZERO, 32, &[path(3)], &[vec![9; 100]]).unwrap();
        let torn = &data[..data.len() - 10];
        assert!(matches!(deserialize_record(torn), Err(LedgerError::WalCorrupted { .. })));
    }

    #[test]
    fn test_trailing_bytes_in_payload_rejected() {
        let mut payload = Hash::ZERO.as_bytes().to_vec();
        payload.extend_from_slice(&32u16.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(0xEE);
        assert!(decode_payload(RecordType::Update, &payload).is_err());
    }

    #[test]
    fn test_reserved_bytes_must_be_zero() {
        let mut data = serialize_delete(&sha3(b"x"));
        data[14] = 1;
        assert!(deserialize_record(&data).is_err());
    }
}
