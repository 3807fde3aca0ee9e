//! Persistent sparse Merkle trie
//!
//! A [`Trie`] is an immutable snapshot identified by its root hash. An update
//! walks only the subtrees the batch touches and returns a new trie that
//! shares every other subtree with its parent, so a batch of `k` registers
//! costs `O(k * height)` regardless of how many registers the trie holds.

pub mod node;
pub mod proof;

use std::sync::Arc;

use crate::error::{LedgerError, LedgerResult};
use crate::hash::{default_hash, hash_value, Hash};
use crate::path::Path;

use node::{Node, Value};
pub use proof::{verify_batch_proof, verify_encoded, BatchProof, ProofEntry, ProofTerminal};

/// Root hash of a trie; the external handle to a register snapshot.
pub type StateCommitment = Hash;

/// Immutable trie snapshot.
#[derive(Debug, Clone)]
pub struct Trie {
    root: Option<Arc<Node>>,
    height: u16,
}

/// One register write inside an update; `None` removes the register.
struct Write {
    path: Path,
    payload: Option<(Value, Hash)>,
}

impl Trie {
    /// The trie with no registers.
    pub fn empty(height: u16) -> Self {
        Self { root: None, height }
    }

    /// Rebuild a trie around an existing root node.
    pub(crate) fn from_root(root: Option<Arc<Node>>, height: u16) -> Self {
        Self { root, height }
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn root_hash(&self) -> StateCommitment {
        node::child_hash(self.root.as_ref(), self.height)
    }

    pub(crate) fn root_node(&self) -> Option<&Arc<Node>> {
        self.root.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Hash of the trie with no registers at the given height.
    pub fn empty_root_hash(height: u16) -> StateCommitment {
        default_hash(height)
    }

    /// Read the values at `paths`, in order. Unset registers read as empty.
    pub fn read(&self, paths: &[Path]) -> Vec<Vec<u8>> {
        paths
            .iter()
            .map(|p| self.lookup(p).map(|v| v.to_vec()).unwrap_or_default())
            .collect()
    }

    fn lookup(&self, path: &Path) -> Option<&Value> {
        let mut node = self.root.as_ref()?;
        let mut depth = 0u16;
        loop {
            match node.as_ref() {
                Node::Leaf { path: leaf_path, value, .. } => {
                    return (leaf_path == path).then_some(value);
                }
                Node::Interior { left, right, .. } => {
                    let next = if path.bit(depth) { right } else { left };
                    node = next.as_ref()?;
                    depth += 1;
                }
            }
        }
    }

    /// Apply a batch and return the resulting trie.
    ///
    /// Empty values remove registers. Fails without side effects when the
    /// batch is malformed.
    pub fn update(&self, paths: &[Path], values: &[Vec<u8>]) -> LedgerResult<Trie> {
        if paths.len() != values.len() {
            return Err(LedgerError::MismatchedLengths {
                paths: paths.len(),
                values: values.len(),
            });
        }
        let mut writes = Vec::with_capacity(paths.len());
        for (path, value) in paths.iter().zip(values) {
            if !path.fits_height(self.height) {
                let used = path
                    .as_bytes()
                    .iter()
                    .rposition(|b| *b != 0)
                    .map_or(0, |i| (i + 1) * 8);
                return Err(LedgerError::PathWidthMismatch {
                    expected: self.height,
                    actual: used as u16,
                });
            }
            let payload = if value.is_empty() {
                None
            } else {
                let v: Value = Arc::from(value.as_slice());
                let vh = hash_value(value);
                Some((v, vh))
            };
            writes.push(Write { path: *path, payload });
        }
        writes.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(dup) = writes.windows(2).find(|w| w[0].path == w[1].path) {
            return Err(LedgerError::DuplicatePath { path: dup[0].path.to_string() });
        }

        let root = self.update_node(self.root.as_ref(), self.height, &writes);
        Ok(Trie { root, height: self.height })
    }

    fn update_node(&self, node: Option<&Arc<Node>>, height: u16, batch: &[Write]) -> Option<Arc<Node>> {
        if batch.is_empty() {
            return node.cloned();
        }
        let Some(existing) = node else {
            return self.build(height, batch);
        };
        match existing.as_ref() {
            Node::Leaf { path, value, value_hash, .. } => {
                if batch.iter().any(|w| w.path == *path) {
                    return self.build(height, batch);
                }
                // push the existing register down alongside the batch
                let at = batch.partition_point(|w| w.path < *path);
                let mut merged: Vec<Write> = Vec::with_capacity(batch.len() + 1);
                merged.extend(batch[..at].iter().map(Write::share));
                merged.push(Write {
                    path: *path,
                    payload: Some((Arc::clone(value), *value_hash)),
                });
                merged.extend(batch[at..].iter().map(Write::share));
                self.build(height, &merged)
            }
            Node::Interior { left, right, .. } => {
                let depth = self.height - height;
                let split = batch.partition_point(|w| !w.path.bit(depth));
                let (lb, rb) = batch.split_at(split);
                let new_left = self.update_node(left.as_ref(), height - 1, lb);
                let new_right = self.update_node(right.as_ref(), height - 1, rb);
                if same(&new_left, left.as_ref()) && same(&new_right, right.as_ref()) {
                    return Some(Arc::clone(existing));
                }
                self.compose(height, new_left, new_right)
            }
        }
    }

    /// Build a fresh subtree for a batch landing on an empty region.
    fn build(&self, height: u16, batch: &[Write]) -> Option<Arc<Node>> {
        if batch.iter().all(|w| w.payload.is_none()) {
            return None;
        }
        if batch.len() == 1 || height == 0 {
            let w = batch.iter().find(|w| w.payload.is_some())?;
            let (value, value_hash) = w.payload.clone()?;
            return Some(Arc::new(Node::leaf(w.path, value, value_hash, height, self.height)));
        }
        let depth = self.height - height;
        let split = batch.partition_point(|w| !w.path.bit(depth));
        let (lb, rb) = batch.split_at(split);
        let left = self.build(height - 1, lb);
        let right = self.build(height - 1, rb);
        self.compose(height, left, right)
    }

    /// Join two children, collapsing a lone leaf upward.
    fn compose(&self, height: u16, left: Option<Arc<Node>>, right: Option<Arc<Node>>) -> Option<Arc<Node>> {
        match (left, right) {
            (None, None) => None,
            (Some(only), None) | (None, Some(only)) if only.is_leaf() => {
                only.lift_leaf(self.height).map(Arc::new)
            }
            (left, right) => Some(Arc::new(Node::interior(height, left, right))),
        }
    }

    /// Number of registers holding a non-empty value. Walks the whole trie.
    pub fn allocated_reg_count(&self) -> u64 {
        fn count(node: Option<&Arc<Node>>) -> u64 {
            match node.map(|n| n.as_ref()) {
                None => 0,
                Some(Node::Leaf { .. }) => 1,
                Some(Node::Interior { left, right, .. }) => count(left.as_ref()) + count(right.as_ref()),
            }
        }
        count(self.root.as_ref())
    }

    /// Build a batch proof for `paths` against this trie.
    pub fn prove(&self, paths: &[Path]) -> BatchProof {
        proof::generate(self, paths)
    }
}

impl Write {
    fn share(&self) -> Write {
        Write {
            path: self.path,
            payload: self.payload.clone(),
        }
    }
}

fn same(new: &Option<Arc<Node>>, old: Option<&Arc<Node>>) -> bool {
    match (new, old) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
