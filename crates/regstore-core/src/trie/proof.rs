//! Batch inclusion / non-inclusion proofs
//!
//! A [`BatchProof`] answers a batch of paths against one commitment. Each
//! entry records where its descent stopped (`steps`), a bitmap of the depths
//! whose sibling is a non-empty subtree, and references into a pool of
//! sibling hashes shared by the whole batch. Empty siblings are implied by
//! the bitmap and cost nothing.
//!
//! Wire format (little-endian):
//!
//! ```text
//! version u8 | height u16 | pool_len u32 | pool_len * hash(32)
//! entry_count u32 | entries...
//! entry: path(height/8) | steps u16 | flags(ceil(steps/8)) | refs(popcount * u32)
//!        | terminal u8 | terminal body
//! terminal 0 = empty subtree, 1 = included (len u32 + value),
//!          2 = other leaf (path(height/8) + value hash)
//! ```
//!
//! Decoding is strict: every byte is significant, so altering any byte of an
//! encoded proof either fails to decode or fails verification.

use hashbrown::HashMap;

use crate::config::SUPPORTED_HEIGHTS;
use crate::error::{LedgerError, LedgerResult};
use crate::hash::{default_hash, hash_interior, hash_value, Hash, HASH_LEN};
use crate::path::Path;

use super::node::{compact_leaf_hash, Node};
use super::{StateCommitment, Trie};

const PROOF_VERSION: u8 = 1;

const TERMINAL_EMPTY: u8 = 0;
const TERMINAL_INCLUDED: u8 = 1;
const TERMINAL_OTHER_LEAF: u8 = 2;

/// Where the descent for one path ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofTerminal {
    /// The register is set; its value follows.
    Included { value: Vec<u8> },
    /// Descent reached an empty subtree.
    Empty,
    /// Descent reached a compacted leaf for a different register.
    OtherLeaf { path: Path, value_hash: Hash },
}

/// Proof for a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofEntry {
    pub path: Path,
    pub steps: u16,
    /// Bit `d` (MSB first) set when the sibling at depth `d` is non-empty.
    pub flags: Vec<u8>,
    /// Pool indices for the set flags, shallowest first.
    pub sibling_refs: Vec<u32>,
    pub terminal: ProofTerminal,
}

impl ProofEntry {
    /// Value proven for this path; empty when the register is unset.
    pub fn value(&self) -> &[u8] {
        match &self.terminal {
            ProofTerminal::Included { value } => value,
            _ => &[],
        }
    }

    pub fn is_inclusion(&self) -> bool {
        matches!(self.terminal, ProofTerminal::Included { .. })
    }

    fn flag(&self, depth: u16) -> bool {
        self.flags
            .get(depth as usize / 8)
            .is_some_and(|b| b & (0x80 >> (depth % 8)) != 0)
    }
}

/// Proof for a batch of paths against one commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProof {
    pub height: u16,
    /// Deduplicated non-empty sibling hashes.
    pub siblings: Vec<Hash>,
    pub entries: Vec<ProofEntry>,
}

pub(crate) fn generate(trie: &Trie, paths: &[Path]) -> BatchProof {
    let height = trie.height();
    let mut pool: Vec<Hash> = Vec::new();
    let mut index: HashMap<Hash, u32> = HashMap::new();
    let mut entries = Vec::with_capacity(paths.len());

    for path in paths {
        let mut flags = vec![0u8; (height as usize + 7) / 8];
        let mut refs = Vec::new();
        let mut depth = 0u16;
        let mut node = trie.root_node();

        let terminal = loop {
            let Some(current) = node else {
                break ProofTerminal::Empty;
            };
            match current.as_ref() {
                Node::Leaf { path: leaf_path, value, value_hash, .. } => {
                    break if leaf_path == path {
                        ProofTerminal::Included { value: value.to_vec() }
                    } else {
                        ProofTerminal::OtherLeaf { path: *leaf_path, value_hash: *value_hash }
                    };
                }
                Node::Interior { left, right, .. } => {
                    let (next, sibling) = if path.bit(depth) { (right, left) } else { (left, right) };
                    if let Some(sibling) = sibling {
                        let h = sibling.hash();
                        let at = *index.entry(h).or_insert_with(|| {
                            pool.push(h);
                            (pool.len() - 1) as u32
                        });
                        flags[depth as usize / 8] |= 0x80 >> (depth % 8);
                        refs.push(at);
                    }
                    node = next.as_ref();
                    depth += 1;
                }
            }
        };

        flags.truncate((depth as usize + 7) / 8);
        entries.push(ProofEntry {
            path: *path,
            steps: depth,
            flags,
            sibling_refs: refs,
            terminal,
        });
    }

    BatchProof { height, siblings: pool, entries }
}

impl BatchProof {
    /// Values proven by this batch, in entry order.
    pub fn values(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.value().to_vec()).collect()
    }

    /// Verify against `commitment` and check the proof answers exactly the
    /// queried `paths`, in order. This is what a light client should call.
    pub fn verify_paths(&self, paths: &[Path], commitment: &StateCommitment) -> bool {
        self.entries.len() == paths.len()
            && self.entries.iter().zip(paths).all(|(e, p)| e.path == *p)
            && self.verify(commitment)
    }

    /// Recompute the root for every entry and compare to `commitment`.
    pub fn verify(&self, commitment: &StateCommitment) -> bool {
        if !SUPPORTED_HEIGHTS.contains(&self.height) {
            return false;
        }
        self.entries
            .iter()
            .all(|entry| self.entry_root(entry).is_some_and(|root| root == *commitment))
    }

    fn entry_root(&self, entry: &ProofEntry) -> Option<Hash> {
        let height = self.height;
        if entry.steps > height || !entry.path.fits_height(height) {
            return None;
        }
        // a canonical descent always stops next to a non-empty sibling
        if entry.steps > 0 && !entry.flag(entry.steps - 1) {
            return None;
        }
        let stop = height - entry.steps;
        let mut hash = match &entry.terminal {
            ProofTerminal::Included { value } => {
                if value.is_empty() {
                    return None;
                }
                compact_leaf_hash(&entry.path, &hash_value(value), stop, height)
            }
            ProofTerminal::Empty => default_hash(stop),
            ProofTerminal::OtherLeaf { path, value_hash } => {
                if *path == entry.path
                    || !path.fits_height(height)
                    || path.common_prefix_bits(&entry.path) < entry.steps
                {
                    return None;
                }
                compact_leaf_hash(path, value_hash, stop, height)
            }
        };

        let mut refs = entry.sibling_refs.iter().rev();
        for depth in (0..entry.steps).rev() {
            let node_height = height - depth;
            let sibling = if entry.flag(depth) {
                *self.siblings.get(*refs.next()? as usize)?
            } else {
                default_hash(node_height - 1)
            };
            hash = if entry.path.bit(depth) {
                hash_interior(node_height, &sibling, &hash)
            } else {
                hash_interior(node_height, &hash, &sibling)
            };
        }
        if refs.next().is_some() {
            return None;
        }
        Some(hash)
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let width = self.height as usize / 8;
        let mut buf = Vec::new();
        buf.push(PROOF_VERSION);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&(self.siblings.len() as u32).to_le_bytes());
        for h in &self.siblings {
            buf.extend_from_slice(h.as_bytes());
        }
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.path.as_bytes()[..width]);
            buf.extend_from_slice(&entry.steps.to_le_bytes());
            buf.extend_from_slice(&entry.flags);
            for r in &entry.sibling_refs {
                buf.extend_from_slice(&r.to_le_bytes());
            }
            match &entry.terminal {
                ProofTerminal::Empty => buf.push(TERMINAL_EMPTY),
                ProofTerminal::Included { value } => {
                    buf.push(TERMINAL_INCLUDED);
                    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    buf.extend_from_slice(value);
                }
                ProofTerminal::OtherLeaf { path, value_hash } => {
                    buf.push(TERMINAL_OTHER_LEAF);
                    buf.extend_from_slice(&path.as_bytes()[..width]);
                    buf.extend_from_slice(value_hash.as_bytes());
                }
            }
        }
        buf
    }

    /// Parse the wire format.
    pub fn decode(bytes: &[u8]) -> LedgerResult<BatchProof> {
        let mut r = ProofReader { buf: bytes, pos: 0 };

        let version = r.u8()?;
        if version != PROOF_VERSION {
            return Err(r.malformed(format!("unsupported version {}", version)));
        }
        let height = r.u16()?;
        if !SUPPORTED_HEIGHTS.contains(&height) {
            return Err(r.malformed(format!("unsupported height {}", height)));
        }
        let width = height as usize / 8;

        let pool_len = r.u32()? as usize;
        let mut siblings = Vec::with_capacity(pool_len.min(bytes.len() / HASH_LEN));
        let mut seen: HashMap<Hash, ()> = HashMap::new();
        for _ in 0..pool_len {
            let h = r.hash()?;
            if seen.insert(h, ()).is_some() {
                return Err(r.malformed("duplicate sibling hash"));
            }
            siblings.push(h);
        }
        let mut referenced = vec![false; pool_len];

        let entry_count = r.u32()? as usize;
        let mut entries = Vec::with_capacity(entry_count.min(bytes.len()));
        for _ in 0..entry_count {
            let path = r.path(width)?;
            let steps = r.u16()?;
            if steps > height {
                return Err(r.malformed(format!("steps {} exceed height {}", steps, height)));
            }
            let flags = r.take((steps as usize + 7) / 8)?.to_vec();
            if steps % 8 != 0 {
                if let Some(last) = flags.last() {
                    if last & (0xFF >> (steps % 8)) != 0 {
                        return Err(r.malformed("flag bits set beyond steps"));
                    }
                }
            }
            let set: u32 = flags.iter().map(|b| b.count_ones()).sum();
            let mut sibling_refs = Vec::with_capacity(set as usize);
            for _ in 0..set {
                let at = r.u32()?;
                let slot = referenced
                    .get_mut(at as usize)
                    .ok_or_else(|| r.malformed(format!("sibling ref {} out of range", at)))?;
                *slot = true;
                sibling_refs.push(at);
            }
            let terminal = match r.u8()? {
                TERMINAL_EMPTY => ProofTerminal::Empty,
                TERMINAL_INCLUDED => {
                    let len = r.u32()? as usize;
                    ProofTerminal::Included { value: r.take(len)?.to_vec() }
                }
                TERMINAL_OTHER_LEAF => ProofTerminal::OtherLeaf {
                    path: r.path(width)?,
                    value_hash: r.hash()?,
                },
                other => return Err(r.malformed(format!("unknown terminal tag {}", other))),
            };
            entries.push(ProofEntry { path, steps, flags, sibling_refs, terminal });
        }

        if r.pos != bytes.len() {
            return Err(r.malformed(format!("{} trailing bytes", bytes.len() - r.pos)));
        }
        if referenced.iter().any(|used| !used) {
            return Err(r.malformed("unreferenced sibling hash"));
        }
        Ok(BatchProof { height, siblings, entries })
    }
}

/// Check every entry of `proof` against `commitment`.
pub fn verify_batch_proof(proof: &BatchProof, commitment: &StateCommitment) -> bool {
    proof.verify(commitment)
}

/// Decode `bytes` and verify it answers `paths` under `commitment`.
pub fn verify_encoded(bytes: &[u8], paths: &[Path], commitment: &StateCommitment) -> bool {
    BatchProof::decode(bytes).is_ok_and(|proof| proof.verify_paths(paths, commitment))
}

struct ProofReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ProofReader<'a> {
    fn malformed(&self, reason: impl Into<String>) -> LedgerError {
        LedgerError::MalformedProof { offset: self.pos, reason: reason.into() }
    }

    fn take(&mut self, n: usize) -> LedgerResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(self.malformed(format!("need {} bytes, {} left", n, self.buf.len() - self.pos))),
        }
    }

    fn u8(&mut self) -> LedgerResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> LedgerResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> LedgerResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn hash(&mut self) -> LedgerResult<Hash> {
        let b = self.take(HASH_LEN)?;
        Hash::from_slice(b).ok_or_else(|| self.malformed("short hash"))
    }

    fn path(&mut self, width: usize) -> LedgerResult<Path> {
        let b = self.take(width)?;
        Path::from_prefix(b).ok_or_else(|| self.malformed("path too wide"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn path(bytes: &[u8]) -> Path {
        Path::from_prefix(bytes).unwrap()
    }

    fn sample_trie() -> (Trie, Vec<Path>, Vec<Vec<u8>>) {
        let mut rng = StdRng::seed_from_u64(3);
        let paths: Vec<Path> = (0..30)
            .map(|_| path(&rng.gen::<[u8; 32]>()))
            .collect();
        let values: Vec<Vec<u8>> = (0..30).map(|i| format!("value-{}", i).into_bytes()).collect();
        let trie = Trie::empty(256).update(&paths, &values).unwrap();
        (trie, paths, values)
    }

    #[test]
    fn test_inclusion_proofs_verify() {
        let (trie, paths, values) = sample_trie();
        let proof = trie.prove(&paths);
        assert!(proof.verify(&trie.root_hash()));
        assert_eq!(proof.values(), values);
        assert!(proof.entries.iter().all(|e| e.is_inclusion()));
    }

    #[test]
    fn test_non_inclusion_proofs_verify() {
        let (trie, _, _) = sample_trie();
        let absent = vec![path(&[0u8; 32]), path(&[0xFF; 32])];
        let proof = trie.prove(&absent);
        assert!(proof.verify(&trie.root_hash()));
        assert!(proof.entries.iter().all(|e| !e.is_inclusion() && e.value().is_empty()));
    }

    #[test]
    fn test_empty_trie_proof() {
        let trie = Trie::empty(64);
        let proof = trie.prove(&[path(&[1, 2, 3, 4, 5, 6, 7, 8])]);
        assert_eq!(proof.entries[0].terminal, ProofTerminal::Empty);
        assert_eq!(proof.entries[0].steps, 0);
        assert!(proof.verify(&Trie::empty_root_hash(64)));
    }

    #[test]
    fn test_siblings_shared_across_batch() {
        let (trie, paths, _) = sample_trie();
        let proof = trie.prove(&paths);
        let total_refs: usize = proof.entries.iter().map(|e| e.sibling_refs.len()).sum();
        assert!(proof.siblings.len() < total_refs);
    }

    #[test]
    fn test_wrong_commitment_fails() {
        let (trie, paths, _) = sample_trie();
        let proof = trie.prove(&paths);
        assert!(!proof.verify(&Trie::empty_root_hash(256)));
    }

    #[test]
    fn test_tampered_value_fails() {
        let (trie, paths, _) = sample_trie();
        let mut proof = trie.prove(&paths[..1]);
        if let ProofTerminal::Included { value } = &mut proof.entries[0].terminal {
            value[0] ^= 0x01;
        }
        assert!(!proof.verify(&trie.root_hash()));
    }

    #[test]
    fn test_encode_decode_preserves_proof() {
        let (trie, mut paths, _) = sample_trie();
        paths.push(path(&[0x42; 32]));
        let proof = trie.prove(&paths);
        let decoded = BatchProof::decode(&proof.encode()).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_every_byte_mutation_detected() {
        let (trie, paths, _) = sample_trie();
        let mut query = paths[..3].to_vec();
        query.push(path(&[0x00; 32]));
        let root = trie.root_hash();
        let encoded = trie.prove(&query).encode();
        assert!(verify_encoded(&encoded, &query, &root));

        for i in 0..encoded.len() {
            for mask in [0x01u8, 0x80] {
                let mut mutated = encoded.clone();
                mutated[i] ^= mask;
                assert!(
                    !verify_encoded(&mutated, &query, &root),
                    "mutation {:#04x} at byte {} went undetected",
                    mask,
                    i
                );
            }
        }
    }

    #[test]
    fn test_padded_descent_rejected() {
        // one extra step past the stop point hashes identically; refuse it
        let (trie, _, _) = sample_trie();
        let mut proof = trie.prove(&[path(&[0x00; 32])]);
        let entry = &mut proof.entries[0];
        entry.steps += 1;
        entry.flags.resize((entry.steps as usize + 7) / 8, 0);
        assert!(!proof.verify(&trie.root_hash()));
    }

    #[test]
    fn test_verify_paths_checks_query() {
        let (trie, paths, _) = sample_trie();
        let proof = trie.prove(&paths[..2]);
        assert!(proof.verify_paths(&paths[..2], &trie.root_hash()));
        assert!(!proof.verify_paths(&paths[1..3], &trie.root_hash()));
        assert!(!proof.verify_paths(&paths[..1], &trie.root_hash()));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let (trie, paths, _) = sample_trie();
        let mut encoded = trie.prove(&paths[..2]).encode();
        encoded.push(0);
        assert!(matches!(
            BatchProof::decode(&encoded),
            Err(LedgerError::MalformedProof { .. })
        ));
    }
}
