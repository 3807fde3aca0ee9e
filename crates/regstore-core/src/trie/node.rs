//! Trie node types
//!
//! Nodes are immutable and shared through `Arc`, so any number of tries can
//! reference the same subtree. An empty subtree is represented by `None` and
//! never allocated.
//!
//! A subtree holding exactly one register is compacted into a single leaf at
//! the subtree root. Its hash is computed as if the leaf had been expanded
//! down to height 0 with empty siblings, which keeps root hashes independent
//! of compaction.

use std::sync::Arc;

use crate::hash::{default_hash, hash_interior, hash_leaf, Hash};
use crate::path::Path;

/// Shared, immutable register value.
pub type Value = Arc<[u8]>;

/// A node in the trie
#[derive(Debug)]
pub enum Node {
    /// A compacted register
    Leaf {
        path: Path,
        value: Value,
        value_hash: Hash,
        height: u16,
        hash: Hash,
    },
    /// Two subtrees, either of which may be empty
    Interior {
        left: Option<Arc<Node>>,
        right: Option<Arc<Node>>,
        height: u16,
        hash: Hash,
    },
}

impl Node {
    /// Create a leaf at `height` in a trie of `trie_height`.
    pub fn leaf(path: Path, value: Value, value_hash: Hash, height: u16, trie_height: u16) -> Self {
        let hash = compact_leaf_hash(&path, &value_hash, height, trie_height);
        Node::Leaf { path, value, value_hash, height, hash }
    }

    /// Create an interior node from its children.
    pub fn interior(height: u16, left: Option<Arc<Node>>, right: Option<Arc<Node>>) -> Self {
        let hash = hash_interior(
            height,
            &child_hash(left.as_ref(), height - 1),
            &child_hash(right.as_ref(), height - 1),
        );
        Node::Interior { left, right, height, hash }
    }

    /// Move a leaf one level up. Costs one hash instead of a full re-expansion.
    pub(crate) fn lift_leaf(&self, trie_height: u16) -> Option<Node> {
        match self {
            Node::Leaf { path, value, value_hash, height, hash } => {
                let up = height + 1;
                let sibling = default_hash(*height);
                let lifted = if path.bit(trie_height - up) {
                    hash_interior(up, &sibling, hash)
                } else {
                    hash_interior(up, hash, &sibling)
                };
                Some(Node::Leaf {
                    path: *path,
                    value: Arc::clone(value),
                    value_hash: *value_hash,
                    height: up,
                    hash: lifted,
                })
            }
            Node::Interior { .. } => None,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Node::Leaf { hash, .. } | Node::Interior { hash, .. } => *hash,
        }
    }

    pub fn height(&self) -> u16 {
        match self {
            Node::Leaf { height, .. } | Node::Interior { height, .. } => *height,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }
}

/// Hash of an optional child at `height`.
pub fn child_hash(node: Option<&Arc<Node>>, height: u16) -> Hash {
    node.map(|n| n.hash()).unwrap_or_else(|| default_hash(height))
}

/// Hash of a lone register sitting at `height` in a trie of `trie_height`.
pub fn compact_leaf_hash(path: &Path, value_hash: &Hash, height: u16, trie_height: u16) -> Hash {
    let width = trie_height as usize / 8;
    let mut hash = hash_leaf(&path.as_bytes()[..width], value_hash);
    for h in 1..=height {
        let sibling = default_hash(h - 1);
        hash = if path.bit(trie_height - h) {
            hash_interior(h, &sibling, &hash)
        } else {
            hash_interior(h, &hash, &sibling)
        };
    }
    hash
}
