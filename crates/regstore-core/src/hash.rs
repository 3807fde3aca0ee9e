//! Hash primitives for trie nodes
//!
//! All hashing is SHA3-256 with a one-byte domain prefix so a leaf can never
//! collide with an interior node:
//!
//! - leaf:     `SHA3(0x00 || path || SHA3(value))`
//! - interior: `SHA3(0x01 || height_be16 || left || right)`
//!
//! An empty subtree of height `h` hashes to `default_hash(h)`, where
//! `default_hash(0) = SHA3("")` and each level combines two copies of the one
//! below. The table is computed once per process.

use std::fmt;
use std::sync::OnceLock;

use sha3::{Digest, Sha3_256};

/// Hash width in bytes
pub const HASH_LEN: usize = 32;

/// Largest trie height with a precomputed default hash.
pub const MAX_HEIGHT: u16 = 256;

const LEAF_PREFIX: u8 = 0x00;
const INTERIOR_PREFIX: u8 = 0x01;

/// A 32-byte SHA3-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Parse from a slice; `None` unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form keeps trie dumps readable
        write!(f, "Hash({}..)", &self.to_hex()[..12])
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }
}

/// SHA3-256 of arbitrary bytes.
pub fn sha3(data: &[u8]) -> Hash {
    Hash(Sha3_256::digest(data).into())
}

/// Hash of a stored value, committed to by its leaf.
pub fn hash_value(value: &[u8]) -> Hash {
    sha3(value)
}

/// Height-0 hash of a register at `path` whose value hashes to `value_hash`.
pub fn hash_leaf(path: &[u8], value_hash: &Hash) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(path);
    hasher.update(value_hash.0);
    Hash(hasher.finalize().into())
}

/// Hash of an interior node at `height` over its two children.
pub fn hash_interior(height: u16, left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update([INTERIOR_PREFIX]);
    hasher.update(height.to_be_bytes());
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

fn default_table() -> &'static [Hash] {
    static TABLE: OnceLock<Vec<Hash>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = Vec::with_capacity(MAX_HEIGHT as usize + 1);
        table.push(sha3(&[]));
        for h in 1..=MAX_HEIGHT {
            let below = table[h as usize - 1];
            table.push(hash_interior(h, &below, &below));
        }
        table
    })
}

/// Hash of an all-empty subtree of the given height.
///
/// Panics if `height > MAX_HEIGHT`; config validation keeps heights in range.
pub fn default_hash(height: u16) -> Hash {
    default_table()[height as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hashes_chain() {
        assert_eq!(default_hash(0), sha3(&[]));
        for h in 1..=MAX_HEIGHT {
            let below = default_hash(h - 1);
            assert_eq!(default_hash(h), hash_interior(h, &below, &below));
        }
    }

    #[test]
    fn test_interior_hash_depends_on_height_and_order() {
        let a = sha3(b"a");
        let b = sha3(b"b");
        assert_ne!(hash_interior(3, &a, &b), hash_interior(4, &a, &b));
        assert_ne!(hash_interior(3, &a, &b), hash_interior(3, &b, &a));
    }

    #[test]
    fn test_leaf_and_interior_domains_differ() {
        let v = hash_value(b"v");
        let leaf = hash_leaf(&[0u8; 32], &v);
        assert_ne!(leaf, hash_interior(0, &Hash::ZERO, &v));
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Hash::from_slice(&[1u8; 32]).is_some());
        assert!(Hash::from_slice(&[1u8; 31]).is_none());
    }
}
