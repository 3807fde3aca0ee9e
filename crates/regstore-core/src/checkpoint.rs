//! Checkpoints: snapshots of the forest at a WAL segment boundary
//!
//! `checkpoint.NNNNNNNN` holds every trie that was live once segments
//! `0..=NNNNNNNN` had been applied. Startup loads the newest checkpoint and
//! replays only the segments after it.
//!
//! File layout (little-endian):
//!
//! ```text
//!   magic "RGCK" | version u8 | height u16 | node count u64
//!   nodes, post-order, each shared subtree written once:
//!     0 | height u16 | path (height/8 bytes) | value len u32 | value
//!     1 | height u16 | left u64 | right u64 | hash (32)     (u64::MAX = empty)
//!   root count u64 | roots, least recently used first: node u64 | commitment (32)
//!   CRC32C u32 of everything before it
//! ```
//!
//! Written with the atomic rename pattern:
//! 1. write `checkpoint.NNNNNNNN.tmp`
//! 2. durable_sync it
//! 3. rename over the final name
//! 4. sync the directory
//!
//! A crash before the rename leaves only a `.tmp` file, which the loader
//! ignores and the next cycle deletes.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::forest::Forest;
use crate::hash::{hash_value, Hash, HASH_LEN};
use crate::path::Path as TriePath;
use crate::platform_durability::{durable_sync, sync_directory};
use crate::trie::node::{Node, Value};
use crate::trie::{StateCommitment, Trie};
use crate::wal::{segment_file_name, Wal, SEGMENT_NAME_DIGITS};

/// Magic bytes at the start of every checkpoint file
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"RGCK";

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u8 = 1;

const CHECKPOINT_PREFIX: &str = "checkpoint.";
const TMP_SUFFIX: &str = ".tmp";
const NO_CHILD: u64 = u64::MAX;
const TAG_LEAF: u8 = 0;
const TAG_INTERIOR: u8 = 1;

/// File name of the checkpoint covering segments up to `index`.
pub fn checkpoint_file_name(index: u64) -> String {
    format!("{}{}", CHECKPOINT_PREFIX, segment_file_name(index))
}

/// Parse a checkpoint file name. Temporary files don't parse.
pub fn parse_checkpoint_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(CHECKPOINT_PREFIX)?;
    if digits.len() == SEGMENT_NAME_DIGITS && digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Indices of every complete checkpoint in `dir`, ascending.
pub fn list_checkpoints(dir: &Path) -> LedgerResult<Vec<u64>> {
    let entries = fs::read_dir(dir).map_err(|e| LedgerError::io_at(dir, e, "Failed to read checkpoint directory"))?;
    let mut indices = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LedgerError::io_at(dir, e, "Failed to read directory entry"))?;
        if let Some(index) = entry.file_name().to_str().and_then(parse_checkpoint_name) {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

/// Index of the newest complete checkpoint in `dir`.
pub fn latest_checkpoint_index(dir: &Path) -> LedgerResult<Option<u64>> {
    Ok(list_checkpoints(dir)?.last().copied())
}

/// Size and shape of a written checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub index: u64,
    pub path: PathBuf,
    pub nodes: u64,
    pub roots: u64,
    pub bytes: u64,
}

/// Forwards bytes while keeping a running CRC32C.
struct CrcWriter<W: Write> {
    inner: W,
    crc: u32,
    written: u64,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, crc: 0, written: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.crc = crc32c::crc32c_append(self.crc, bytes);
        self.written += bytes.len() as u64;
        self.inner.write_all(bytes)
    }
}

/// Post-order list of distinct nodes reachable from `tries`.
fn collect_nodes(tries: &[Arc<Trie>]) -> (Vec<Arc<Node>>, HashMap<Hash, u64>) {
    fn visit(node: &Arc<Node>, order: &mut Vec<Arc<Node>>, index: &mut HashMap<Hash, u64>) {
        if index.contains_key(&node.hash()) {
            return;
        }
        if let Node::Interior { left, right, .. } = node.as_ref() {
            for child in [left, right].into_iter().flatten() {
                visit(child, order, index);
            }
        }
        index.insert(node.hash(), order.len() as u64);
        order.push(Arc::clone(node));
    }

    let mut order = Vec::new();
    let mut index = HashMap::new();
    for trie in tries {
        if let Some(root) = trie.root_node() {
            visit(root, &mut order, &mut index);
        }
    }
    (order, index)
}

/// Write `tries` (least recently used first) as checkpoint `index` in `dir`.
pub fn write_checkpoint(dir: &Path, index: u64, height: u16, tries: &[Arc<Trie>]) -> LedgerResult<CheckpointSummary> {
    let final_path = dir.join(checkpoint_file_name(index));
    let tmp_path = dir.join(format!("{}{}", checkpoint_file_name(index), TMP_SUFFIX));
    let width = height as usize / 8;

    let (nodes, positions) = collect_nodes(tries);
    let roots: Vec<(u64, StateCommitment)> = tries
        .iter()
        .filter_map(|t| t.root_node().map(|r| (positions[&r.hash()], t.root_hash())))
        .collect();

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| LedgerError::io_at(&tmp_path, e, "Failed to create checkpoint file"))?;
    let io_err = |e: std::io::Error| LedgerError::io_at(&tmp_path, e, "Failed to write checkpoint");

    let mut w = CrcWriter::new(BufWriter::new(file));
    w.put(&CHECKPOINT_MAGIC).map_err(io_err)?;
    w.put(&[CHECKPOINT_VERSION]).map_err(io_err)?;
    w.put(&height.to_le_bytes()).map_err(io_err)?;
    w.put(&(nodes.len() as u64).to_le_bytes()).map_err(io_err)?;
    for node in &nodes {
        match node.as_ref() {
            Node::Leaf { path, value, height, .. } => {
                w.put(&[TAG_LEAF]).map_err(io_err)?;
                w.put(&height.to_le_bytes()).map_err(io_err)?;
                w.put(&path.as_bytes()[..width]).map_err(io_err)?;
                w.put(&(value.len() as u32).to_le_bytes()).map_err(io_err)?;
                w.put(value).map_err(io_err)?;
            }
            Node::Interior { left, right, height, hash } => {
                let child = |c: &Option<Arc<Node>>| c.as_ref().map_or(NO_CHILD, |n| positions[&n.hash()]);
                w.put(&[TAG_INTERIOR]).map_err(io_err)?;
                w.put(&height.to_le_bytes()).map_err(io_err)?;
                w.put(&child(left).to_le_bytes()).map_err(io_err)?;
                w.put(&child(right).to_le_bytes()).map_err(io_err)?;
                w.put(hash.as_bytes()).map_err(io_err)?;
            }
        }
    }
    w.put(&(roots.len() as u64).to_le_bytes()).map_err(io_err)?;
    for (node, commitment) in &roots {
        w.put(&node.to_le_bytes()).map_err(io_err)?;
        w.put(commitment.as_bytes()).map_err(io_err)?;
    }
    let crc = w.crc;
    let bytes = w.written + 4;
    let mut inner = w.inner;
    inner.write_all(&crc.to_le_bytes()).map_err(io_err)?;
    let file = inner
        .into_inner()
        .map_err(|e| LedgerError::io_at(&tmp_path, e.into_error(), "Failed to flush checkpoint"))?;
    durable_sync(&file).map_err(|e| LedgerError::io_at(&tmp_path, e, "Failed to sync checkpoint"))?;
    drop(file);

    fs::rename(&tmp_path, &final_path)
        .map_err(|e| LedgerError::io_at(&final_path, e, "Failed to rename checkpoint"))?;
    sync_directory(dir).map_err(|e| LedgerError::io_at(dir, e, "Failed to sync directory after checkpoint"))?;

    Ok(CheckpointSummary {
        index,
        path: final_path,
        nodes: nodes.len() as u64,
        roots: roots.len() as u64,
        bytes,
    })
}

/// Load checkpoint `index` from `dir`. Tries come back least recently used
/// first, sharing every subtree they shared when written.
pub fn load_checkpoint(dir: &Path, index: u64, height: u16) -> LedgerResult<Vec<Arc<Trie>>> {
    let path = dir.join(checkpoint_file_name(index));
    let bytes = fs::read(&path).map_err(|e| LedgerError::io_at(&path, e, "Failed to read checkpoint"))?;
    decode_checkpoint(&path, &bytes, height)
}

fn decode_checkpoint(path: &Path, bytes: &[u8], height: u16) -> LedgerResult<Vec<Arc<Trie>>> {
    let corrupt = |reason: String| LedgerError::CheckpointCorrupted {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < 4 {
        return Err(corrupt("file too short".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32c::crc32c(body);
    if expected != actual {
        return Err(LedgerError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
            offset: body.len() as u64,
        });
    }

    let mut r = Reader { buf: body, pos: 0 };
    let short = |()| corrupt("unexpected end of file".into());
    if r.take(4).map_err(short)? != CHECKPOINT_MAGIC {
        return Err(corrupt("bad magic".into()));
    }
    let version = r.u8().map_err(short)?;
    if version != CHECKPOINT_VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }
    let file_height = r.u16().map_err(short)?;
    if file_height != height {
        return Err(LedgerError::InvalidConfig(format!(
            "checkpoint {} was written for trie height {}, configured height is {}",
            path.display(),
            file_height,
            height
        )));
    }
    let width = height as usize / 8;

    let count = r.u64().map_err(short)?;
    // each node takes at least 7 bytes
    let mut nodes: Vec<Arc<Node>> = Vec::with_capacity((count as usize).min(body.len() / 7));
    for i in 0..count {
        let tag = r.u8().map_err(short)?;
        let node_height = r.u16().map_err(short)?;
        if node_height > height {
            return Err(corrupt(format!("node {} has height {} above trie height", i, node_height)));
        }
        let node = match tag {
            TAG_LEAF => {
                let path = TriePath::from_prefix(r.take(width).map_err(short)?)
                    .ok_or_else(|| corrupt("bad leaf path".into()))?;
                let len = r.u32().map_err(short)? as usize;
                let value: Value = Arc::from(r.take(len).map_err(short)?);
                if value.is_empty() {
                    return Err(corrupt(format!("leaf {} has an empty value", i)));
                }
                let vh = hash_value(&value);
                Node::leaf(path, value, vh, node_height, height)
            }
            TAG_INTERIOR => {
                let left = r.u64().map_err(short)?;
                let right = r.u64().map_err(short)?;
                let stored = Hash::from_slice(r.take(HASH_LEN).map_err(short)?)
                    .ok_or_else(|| corrupt("bad hash".into()))?;
                if node_height == 0 {
                    return Err(corrupt(format!("interior node {} at height 0", i)));
                }
                let child = |idx: u64| -> LedgerResult<Option<Arc<Node>>> {
                    if idx == NO_CHILD {
                        return Ok(None);
                    }
                    let c = nodes
                        .get(idx as usize)
                        .filter(|_| idx < i)
                        .ok_or_else(|| corrupt(format!("node {} refers forward to {}", i, idx)))?;
                    if c.height() != node_height - 1 {
                        return Err(corrupt(format!("node {} child height mismatch", i)));
                    }
                    Ok(Some(Arc::clone(c)))
                };
                let (l, rt) = (child(left)?, child(right)?);
                let node = Node::interior(node_height, l, rt);
                if node.hash() != stored {
                    return Err(corrupt(format!("node {} hash mismatch", i)));
                }
                node
            }
            other => return Err(corrupt(format!("unknown node tag {}", other))),
        };
        nodes.push(Arc::new(node));
    }

    let root_count = r.u64().map_err(short)?;
    let mut tries = Vec::with_capacity((root_count as usize).min(body.len() / 40));
    for _ in 0..root_count {
        let idx = r.u64().map_err(short)?;
        let commitment = Hash::from_slice(r.take(HASH_LEN).map_err(short)?)
            .ok_or_else(|| corrupt("bad commitment".into()))?;
        let root = nodes
            .get(idx as usize)
            .ok_or_else(|| corrupt(format!("root refers to missing node {}", idx)))?;
        if root.height() != height || root.hash() != commitment {
            return Err(corrupt(format!("root {} does not match its node", commitment)));
        }
        tries.push(Arc::new(Trie::from_root(Some(Arc::clone(root)), height)));
    }
    if r.pos != body.len() {
        return Err(corrupt(format!("{} trailing bytes", body.len() - r.pos)));
    }
    Ok(tries)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ()> {
        if self.buf.len() - self.pos < n {
            return Err(());
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, ()> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ()> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ()> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ()> {
        let mut a = [0u8; 8];
        a.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(a))
    }
}

/// Remove `.tmp` leftovers of interrupted checkpoint writes.
fn remove_stale_temp_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(CHECKPOINT_PREFIX) && name.ends_with(TMP_SUFFIX) {
            match fs::remove_file(entry.path()) {
                Ok(()) => debug!(file = name, "removed stale checkpoint temp file"),
                Err(e) => warn!(file = name, error = %e, "failed to remove stale checkpoint temp file"),
            }
        }
    }
}

/// Produces checkpoints for one ledger directory.
///
/// `fence` is the commit fence shared with the ledger: writers hold it
/// shared from WAL append to forest insertion, a cycle takes it exclusively
/// only to seal the active segment and snapshot the forest.
pub struct Checkpointer {
    dir: PathBuf,
    height: u16,
    wal: Arc<Wal>,
    forest: Arc<Forest>,
    fence: Arc<RwLock<()>>,
    /// One cycle at a time
    cycle: Mutex<()>,
}

impl Checkpointer {
    pub fn new(dir: PathBuf, height: u16, wal: Arc<Wal>, forest: Arc<Forest>, fence: Arc<RwLock<()>>) -> Self {
        Self {
            dir,
            height,
            wal,
            forest,
            fence,
            cycle: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Index of the newest complete checkpoint.
    pub fn latest_checkpoint(&self) -> LedgerResult<Option<u64>> {
        latest_checkpoint_index(&self.dir)
    }

    /// Segments whose records no checkpoint covers yet, as an inclusive
    /// range ending at the active segment.
    pub fn not_checkpointed_segments(&self) -> LedgerResult<Option<(u64, u64)>> {
        let from = match self.latest_checkpoint()? {
            Some(index) => index + 1,
            None => self.wal.segment_range()?.0,
        };
        let to = self.wal.active_segment();
        Ok((from <= to).then_some((from, to)))
    }

    /// Run one cycle. Writes a checkpoint if at least one sealed segment is
    /// not yet covered, and returns its index.
    pub fn checkpoint_now(&self) -> LedgerResult<Option<u64>> {
        let _cycle = self.cycle.lock();
        remove_stale_temp_files(&self.dir);

        let Some((from, active)) = self.not_checkpointed_segments()? else {
            return Ok(None);
        };
        if from >= active {
            return Ok(None);
        }

        let (cut, tries) = {
            let _fence = self.fence.write();
            let sealed = self.wal.rotate_if_nonempty()?;
            (sealed, self.forest.snapshot())
        };
        let Some(cut) = cut else {
            return Ok(None);
        };

        let summary = write_checkpoint(&self.dir, cut, self.height, &tries)?;
        info!(
            checkpoint = summary.index,
            segments_from = from,
            tries = summary.roots,
            nodes = summary.nodes,
            bytes = summary.bytes,
            "wrote checkpoint"
        );
        Ok(Some(cut))
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer").field("dir", &self.dir).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::forest::IgnoreEvictions;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn path(b: u8) -> TriePath {
        TriePath::from_prefix(&[b, b.wrapping_mul(31)]).unwrap()
    }

    fn sample_tries(height: u16) -> Vec<Arc<Trie>> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut tries = vec![Arc::new(Trie::empty(height))];
        for _ in 0..6 {
            let base = Arc::clone(tries.last().unwrap());
            let paths: Vec<TriePath> = (0..4).map(|_| path(rng.gen())).collect();
            let mut dedup = paths.clone();
            dedup.sort();
            dedup.dedup();
            let values: Vec<Vec<u8>> = dedup.iter().map(|_| vec![rng.gen(); rng.gen_range(1..40)]).collect();
            tries.push(Arc::new(base.update(&dedup, &values).unwrap()));
        }
        tries.remove(0);
        tries
    }

    #[test]
    fn test_checkpoint_names() {
        assert_eq!(checkpoint_file_name(9), "checkpoint.00000009");
        assert_eq!(parse_checkpoint_name("checkpoint.00000009"), Some(9));
        assert_eq!(parse_checkpoint_name("checkpoint.00000009.tmp"), None);
        assert_eq!(parse_checkpoint_name("00000009"), None);
    }

    #[test]
    fn test_write_load_preserves_roots_and_sharing() {
        let temp = TempDir::new().unwrap();
        let tries = sample_tries(16);
        let summary = write_checkpoint(temp.path(), 3, 16, &tries).unwrap();
        assert_eq!(summary.roots, tries.len() as u64);

        let loaded = load_checkpoint(temp.path(), 3, 16).unwrap();
        let roots: Vec<_> = loaded.iter().map(|t| t.root_hash()).collect();
        let expected: Vec<_> = tries.iter().map(|t| t.root_hash()).collect();
        assert_eq!(roots, expected);

        let all_paths: Vec<TriePath> = (0..=255u8).map(path).collect();
        for (a, b) in tries.iter().zip(&loaded) {
            assert_eq!(a.read(&all_paths), b.read(&all_paths));
        }

        // consecutive tries share untouched subtrees after loading too
        let l0 = loaded[0].root_node().unwrap();
        let l1 = loaded[1].root_node().unwrap();
        if let (Node::Interior { left: a, right: b, .. }, Node::Interior { left: c, right: d, .. }) =
            (l0.as_ref(), l1.as_ref())
        {
            let shared = matches!((a, c), (Some(x), Some(y)) if Arc::ptr_eq(x, y))
                || matches!((b, d), (Some(x), Some(y)) if Arc::ptr_eq(x, y));
            let same_hash = matches!((a, c), (Some(x), Some(y)) if x.hash() == y.hash())
                || matches!((b, d), (Some(x), Some(y)) if x.hash() == y.hash());
            assert_eq!(shared, same_hash);
        }
    }

    #[test]
    fn test_dedup_shared_nodes_written_once() {
        let tries = sample_tries(16);
        let (nodes, _) = collect_nodes(&tries);
        let mut hashes: Vec<Hash> = nodes.iter().map(|n| n.hash()).collect();
        let before = hashes.len();
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), before);
    }

    #[test]
    fn test_corruption_detected() {
        let temp = TempDir::new().unwrap();
        let tries = sample_tries(16);
        write_checkpoint(temp.path(), 0, 16, &tries).unwrap();
        let file = temp.path().join(checkpoint_file_name(0));
        let mut bytes = fs::read(&file).unwrap();
        bytes[20] ^= 0x10;
        fs::write(&file, bytes).unwrap();
        let err = load_checkpoint(temp.path(), 0, 16).unwrap_err();
        assert!(matches!(err, LedgerError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_height_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        write_checkpoint(temp.path(), 0, 16, &sample_tries(16)).unwrap();
        let err = load_checkpoint(temp.path(), 0, 32).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidConfig(_)));
    }

    #[test]
    fn test_tmp_file_invisible() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("checkpoint.00000004.tmp"), b"partial").unwrap();
        write_checkpoint(temp.path(), 2, 16, &sample_tries(16)).unwrap();
        assert_eq!(list_checkpoints(temp.path()).unwrap(), vec![2]);
        assert_eq!(latest_checkpoint_index(temp.path()).unwrap(), Some(2));
    }

    fn checkpointer(dir: &Path, segment_size: u64) -> (Checkpointer, Arc<Wal>, Arc<Forest>) {
        let config = Config {
            trie_height: 16,
            segment_size_bytes: segment_size,
            ..Config::testing()
        };
        let wal = Arc::new(Wal::open(dir, &config, 0).unwrap());
        let forest = Arc::new(Forest::new(16, 10, Arc::new(IgnoreEvictions)));
        let cp = Checkpointer::new(
            dir.to_path_buf(),
            16,
            Arc::clone(&wal),
            Arc::clone(&forest),
            Arc::new(RwLock::new(())),
        );
        (cp, wal, forest)
    }

    #[test]
    fn test_nothing_to_do_without_sealed_segment() {
        let temp = TempDir::new().unwrap();
        let (cp, wal, _forest) = checkpointer(temp.path(), 1 << 20);
        wal.record_delete(&Hash::ZERO).unwrap();
        assert_eq!(cp.not_checkpointed_segments().unwrap(), Some((0, 0)));
        assert_eq!(cp.checkpoint_now().unwrap(), None);
        assert_eq!(cp.latest_checkpoint().unwrap(), None);
    }

    #[test]
    fn test_cycle_seals_active_segment_and_covers_it() {
        let temp = TempDir::new().unwrap();
        let (cp, wal, forest) = checkpointer(temp.path(), 1024);
        let empty = forest.empty_root_hash();

        // one full segment, then a partial one
        let t1 = forest.update(&empty, &[path(1)], &[vec![1; 2000]]).unwrap();
        wal.record_update(&empty, &[path(1)], &[vec![1; 2000]]).unwrap();
        let t2 = forest.update(&t1.root_hash(), &[path(2)], &[vec![2]]).unwrap();
        wal.record_update(&t1.root_hash(), &[path(2)], &[vec![2]]).unwrap();
        assert_eq!(cp.not_checkpointed_segments().unwrap(), Some((0, 1)));

        assert_eq!(cp.checkpoint_now().unwrap(), Some(1));
        assert_eq!(cp.not_checkpointed_segments().unwrap(), Some((2, 2)));
        assert_eq!(cp.checkpoint_now().unwrap(), None);

        let loaded = load_checkpoint(temp.path(), 1, 16).unwrap();
        let roots: Vec<_> = loaded.iter().map(|t| t.root_hash()).collect();
        assert_eq!(roots, vec![t1.root_hash(), t2.root_hash()]);
    }
}
