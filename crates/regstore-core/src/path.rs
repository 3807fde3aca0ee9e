//! Register identifiers and the trie paths derived from them
//!
//! A [`RegisterId`] is hashed into a fixed-width [`Path`]; the path, not the
//! identifier, addresses the trie and is what the WAL persists. Two
//! identifiers that hash to the same path address the same register.

use std::fmt;

use sha3::{Digest, Sha3_256};

use crate::config::Config;
use crate::error::{LedgerError, LedgerResult};

/// Widest supported path in bytes (256-bit tries).
pub const MAX_PATH_BYTES: usize = 32;

/// Identifier of a storage cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId {
    pub owner: String,
    pub controller: String,
    pub key: String,
}

impl RegisterId {
    pub fn new(owner: impl Into<String>, controller: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            controller: controller.into(),
            key: key.into(),
        }
    }
}

/// Renders as `hex(owner)/hex(controller)/hex(key)`.
impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            hex::encode(&self.owner),
            hex::encode(&self.controller),
            hex::encode(&self.key)
        )
    }
}

/// Fixed-width bit path. Bits beyond the trie height are always zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Path([u8; MAX_PATH_BYTES]);

impl Path {
    /// Build a path from its leading `bytes`; the remainder is zero-filled.
    pub fn from_prefix(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_PATH_BYTES {
            return None;
        }
        let mut arr = [0u8; MAX_PATH_BYTES];
        arr[..bytes.len()].copy_from_slice(bytes);
        Some(Path(arr))
    }

    pub fn as_bytes(&self) -> &[u8; MAX_PATH_BYTES] {
        &self.0
    }

    /// Bit at `index`, most significant bit of byte 0 first.
    pub fn bit(&self, index: u16) -> bool {
        let byte = self.0[index as usize / 8];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    /// Number of leading bits shared with `other`.
    pub fn common_prefix_bits(&self, other: &Path) -> u16 {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return (i * 8) as u16 + diff.leading_zeros() as u16;
            }
        }
        (MAX_PATH_BYTES * 8) as u16
    }

    /// True if every bit at or beyond `height` is zero.
    pub fn fits_height(&self, height: u16) -> bool {
        let full = height as usize / 8;
        self.0[full..].iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({}..)", &hex::encode(&self.0[..6]))
    }
}

/// Deterministic [`RegisterId`] to [`Path`] mapping for one trie height.
#[derive(Debug, Clone, Copy)]
pub struct PathEncoder {
    height: u16,
    max_part_size: usize,
}

impl PathEncoder {
    pub fn new(height: u16, max_part_size: usize) -> Self {
        Self { height, max_part_size }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.trie_height, config.max_register_part_size)
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Encode one identifier.
    ///
    /// Each component is length-prefixed before hashing so that moving bytes
    /// between owner, controller and key always changes the digest.
    pub fn encode(&self, id: &RegisterId) -> LedgerResult<Path> {
        let mut hasher = Sha3_256::new();
        for (component, part) in [("owner", &id.owner), ("controller", &id.controller), ("key", &id.key)] {
            if part.len() > self.max_part_size {
                return Err(LedgerError::OversizedRegisterPart {
                    component,
                    size: part.len(),
                    max: self.max_part_size,
                });
            }
            hasher.update((part.len() as u32).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest: [u8; 32] = hasher.finalize().into();
        let width = self.height as usize / 8;
        Ok(Path::from_prefix(&digest[..width]).unwrap_or_default())
    }

    /// Encode a batch, failing on the first invalid identifier.
    pub fn encode_all(&self, ids: &[RegisterId]) -> LedgerResult<Vec<Path>> {
        ids.iter().map(|id| self.encode(id)).collect()
    }
}
