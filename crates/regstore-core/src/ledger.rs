//! Ledger: the register store façade
//!
//! Combines the forest of tries with the segmented WAL and checkpoints.
//!
//! **Read path**: encode paths, look up the trie, read without locks
//! **Write path**: build the trie, then WAL (durability point), then forest
//! (visibility point)
//! **Background**: the compactor writes checkpoints on a cadence
//!
//! If the forest cannot take a trie whose update record is already durable,
//! the log and the in-memory view have diverged. That is not returned as an
//! error: the process logs it and aborts, and the next start rebuilds the
//! forest from the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::checkpoint::{latest_checkpoint_index, load_checkpoint, parse_checkpoint_name, Checkpointer};
use crate::compactor::{start_compactor, CompactorHandle, CompactorStats};
use crate::config::Config;
use crate::error::{LedgerError, LedgerResult};
use crate::forest::{EvictionObserver, Forest};
use crate::path::{Path as TriePath, PathEncoder, RegisterId};
use crate::trie::{BatchProof, StateCommitment, Trie};
use crate::wal::{parse_segment_name, ReplayHandler, ReplayStats, Wal};

/// Writes a delete record before a trie leaves the forest.
struct WalEvictionObserver {
    wal: Arc<Wal>,
}

impl EvictionObserver for WalEvictionObserver {
    fn on_evict(&self, commitment: &StateCommitment, _trie: &Trie) -> LedgerResult<()> {
        self.wal.record_delete(commitment)
    }
}

/// Applies replayed records to the forest.
///
/// Updates and evictions are logged under the commit lock in the order they
/// reach the forest, so every update's parent is cached at its point in the
/// log.
struct ForestReplay<'a> {
    forest: &'a Forest,
}

impl ReplayHandler for ForestReplay<'_> {
    fn on_update(
        &mut self,
        segment: u64,
        parent: StateCommitment,
        paths: Vec<TriePath>,
        values: Vec<Vec<u8>>,
    ) -> LedgerResult<()> {
        let base = self.forest.get(&parent).ok_or_else(|| LedgerError::ReplayFailed {
            segment,
            reason: format!("update refers to unknown parent {}", parent),
        })?;
        let next = base
            .update(&paths, &values)
            .map_err(|e| LedgerError::ReplayFailed { segment, reason: e.to_string() })?;
        self.forest.put_unbounded(Arc::new(next));
        Ok(())
    }

    fn on_delete(&mut self, segment: u64, commitment: StateCommitment) -> LedgerResult<()> {
        if self.forest.remove(&commitment).is_none() {
            debug!(segment, commitment = %commitment, "delete record for a trie not in the forest");
        }
        Ok(())
    }
}

/// Fork-aware register store.
///
/// All public methods take `&self`; any number of threads may call `get`,
/// `set` and `prove` concurrently.
pub struct Ledger {
    dir: PathBuf,
    config: Config,
    encoder: PathEncoder,
    wal: Arc<Wal>,
    forest: Arc<Forest>,
    /// Held shared from WAL append to forest insertion; see [`Checkpointer`]
    fence: Arc<RwLock<()>>,
    /// Orders update records and forest insertions (with their eviction
    /// records) the same way in the log and in memory
    commit: Mutex<()>,
    checkpointer: Arc<Checkpointer>,
    compactor: Mutex<Option<CompactorHandle>>,
}

impl Ledger {
    /// Open or create a ledger in `dir`.
    ///
    /// Loads the newest checkpoint, replays the segments after it and trims
    /// the forest to capacity. Corruption anywhere except a torn tail of the
    /// newest segment fails the open.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> LedgerResult<Self> {
        config.validate().map_err(LedgerError::InvalidConfig)?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| LedgerError::io_at(&dir, e, "Failed to create ledger directory"))?;

        let checkpoint = latest_checkpoint_index(&dir)?;
        let wal = Arc::new(Wal::open(&dir, &config, checkpoint.map_or(0, |i| i + 1))?);
        let observer = Arc::new(WalEvictionObserver { wal: Arc::clone(&wal) });
        let forest = Arc::new(Forest::new(config.trie_height, config.forest_capacity, observer));

        let mut loaded = 0;
        if let Some(index) = checkpoint {
            let tries = load_checkpoint(&dir, index, config.trie_height)?;
            loaded = tries.len();
            for trie in tries {
                forest.put_unbounded(trie);
            }
        }

        let from = match checkpoint {
            Some(index) => index + 1,
            None => wal.segment_range()?.0,
        };
        let stats: ReplayStats = wal.replay(from, &mut ForestReplay { forest: &forest })?;
        let evicted = forest.enforce_capacity()?;

        info!(
            dir = %dir.display(),
            checkpoint = ?checkpoint,
            checkpoint_tries = loaded,
            replayed_segments = stats.segments,
            updates = stats.updates,
            deletes = stats.deletes,
            evicted,
            tries = forest.len(),
            "ledger recovered"
        );

        let fence = Arc::new(RwLock::new(()));
        let checkpointer = Arc::new(Checkpointer::new(
            dir.clone(),
            config.trie_height,
            Arc::clone(&wal),
            Arc::clone(&forest),
            Arc::clone(&fence),
        ));

        Ok(Self {
            encoder: PathEncoder::from_config(&config),
            dir,
            config,
            wal,
            forest,
            fence,
            commit: Mutex::new(()),
            checkpointer,
            compactor: Mutex::new(None),
        })
    }

    /// Root hash of the trie with no registers at the configured height.
    pub fn empty_state_commitment(&self) -> StateCommitment {
        self.forest.empty_root_hash()
    }

    /// Read registers at `commitment`. Unset registers read as empty.
    pub fn get(&self, commitment: &StateCommitment, ids: &[RegisterId]) -> LedgerResult<Vec<Vec<u8>>> {
        let paths = self.encoder.encode_all(ids)?;
        self.forest.read(commitment, &paths)
    }

    /// Write registers on top of `commitment` and return the new commitment.
    ///
    /// An empty batch is a no-op and returns `commitment`. Invalid input, a
    /// parent evicted in the meantime and a failed WAL append all return an
    /// error with nothing written. Once the update record is durable the new
    /// trie is always published.
    pub fn set(
        &self,
        commitment: &StateCommitment,
        ids: &[RegisterId],
        values: &[Vec<u8>],
    ) -> LedgerResult<StateCommitment> {
        if ids.len() != values.len() {
            return Err(LedgerError::MismatchedLengths {
                paths: ids.len(),
                values: values.len(),
            });
        }
        if ids.is_empty() {
            return Ok(*commitment);
        }
        if let Some(v) = values.iter().find(|v| v.len() > self.config.max_value_size) {
            return Err(LedgerError::OversizedValue {
                size: v.len(),
                max: self.config.max_value_size,
            });
        }
        let paths = self.encoder.encode_all(ids)?;
        let mut sorted = paths.clone();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(LedgerError::DuplicatePath { path: pair[0].to_string() });
        }

        let base = self.forest.require(commitment)?;
        let next = Arc::new(base.update(&paths, values)?);
        let new_commitment = next.root_hash();

        let _fence = self.fence.read();
        let _commit = self.commit.lock();
        // the parent may have been evicted while the trie was computed
        if !self.forest.contains(commitment) {
            return Err(LedgerError::CommitmentNotFound { commitment: *commitment });
        }
        self.wal.record_update(commitment, &paths, values)?;
        if let Err(e) = self.forest.put(next) {
            diverged(commitment, &e);
        }
        debug!(parent = %commitment, commitment = %new_commitment, registers = ids.len(), "set");
        Ok(new_commitment)
    }

    /// Batch proof for `ids` at `commitment`, encoded to the wire format.
    pub fn prove(&self, commitment: &StateCommitment, ids: &[RegisterId]) -> LedgerResult<Vec<u8>> {
        Ok(self.prove_batch(commitment, ids)?.encode())
    }

    /// Batch proof for `ids` at `commitment`.
    pub fn prove_batch(&self, commitment: &StateCommitment, ids: &[RegisterId]) -> LedgerResult<BatchProof> {
        let paths = self.encoder.encode_all(ids)?;
        self.forest.proofs(commitment, &paths)
    }

    /// Trie paths of `ids` under this ledger's encoding.
    pub fn paths(&self, ids: &[RegisterId]) -> LedgerResult<Vec<TriePath>> {
        self.encoder.encode_all(ids)
    }

    /// Number of cached tries.
    pub fn forest_size(&self) -> usize {
        self.forest.len()
    }

    /// Cached commitments, least recently used first.
    pub fn cached_commitments(&self) -> Vec<StateCommitment> {
        self.forest.cached_commitments()
    }

    /// Bytes used by WAL segments and checkpoints.
    pub fn disk_size(&self) -> LedgerResult<u64> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| LedgerError::io_at(&self.dir, e, "Failed to read ledger directory"))?;
        let mut total = 0;
        for entry in entries {
            let entry = entry.map_err(|e| LedgerError::io_at(&self.dir, e, "Failed to read directory entry"))?;
            let ours = entry
                .file_name()
                .to_str()
                .is_some_and(|n| parse_segment_name(n).is_some() || parse_checkpoint_name(n).is_some());
            if ours {
                total += entry
                    .metadata()
                    .map_err(|e| LedgerError::io_at(&entry.path(), e, "Failed to stat ledger file"))?
                    .len();
            }
        }
        Ok(total)
    }

    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start the background compactor. No-op if it is already running.
    pub fn start_compactor(&self) -> LedgerResult<()> {
        let mut compactor = self.compactor.lock();
        if compactor.is_none() {
            *compactor = Some(start_compactor(
                Arc::clone(&self.checkpointer),
                self.config.checkpoint_interval,
            )?);
        }
        Ok(())
    }

    /// Stop the compactor and wait for it. Returns its counters if it ran.
    pub fn stop_compactor(&self) -> Option<Arc<CompactorStats>> {
        self.compactor.lock().take().map(CompactorHandle::shutdown)
    }

    /// Stop background work and sync the active segment.
    pub fn close(&self) -> LedgerResult<()> {
        self.stop_compactor();
        self.wal.sync()
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        self.stop_compactor();
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("dir", &self.dir)
            .field("forest", &self.forest)
            .field("wal", &self.wal)
            .finish()
    }
}

/// The update is durable but can't be published.
fn diverged(parent: &StateCommitment, err: &LedgerError) -> ! {
    error!(
        parent = %parent,
        error = %err,
        "forest update failed after its WAL record was written; aborting"
    );
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reg(key: &str) -> RegisterId {
        RegisterId::new("owner", "", key)
    }

    fn open(dir: &Path) -> Ledger {
        Ledger::open(dir, Config::testing()).unwrap()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let ledger = open(temp.path());
        let empty = ledger.empty_state_commitment();

        let ids = vec![reg("a"), reg("b")];
        let c1 = ledger.set(&empty, &ids, &[b"1".to_vec(), b"2".to_vec()]).unwrap();
        assert_ne!(c1, empty);
        assert_eq!(ledger.get(&c1, &ids).unwrap(), vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(ledger.get(&empty, &ids).unwrap(), vec![Vec::<u8>::new(), Vec::new()]);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let temp = TempDir::new().unwrap();
        let ledger = open(temp.path());
        let empty = ledger.empty_state_commitment();
        let before = ledger.disk_size().unwrap();
        assert_eq!(ledger.set(&empty, &[], &[]).unwrap(), empty);
        assert_eq!(ledger.disk_size().unwrap(), before);
    }

    #[test]
    fn test_invalid_input_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let ledger = open(temp.path());
        let empty = ledger.empty_state_commitment();

        let dup = ledger.set(&empty, &[reg("a"), reg("a")], &[vec![1], vec![2]]).unwrap_err();
        assert!(matches!(dup, LedgerError::DuplicatePath { .. }));
        let mismatch = ledger.set(&empty, &[reg("a")], &[]).unwrap_err();
        assert!(matches!(mismatch, LedgerError::MismatchedLengths { .. }));
        let big = ledger
            .set(&empty, &[reg("a")], &[vec![0; Config::testing().max_value_size + 1]])
            .unwrap_err();
        assert!(matches!(big, LedgerError::OversizedValue { .. }));
        let long_key = "k".repeat(2000);
        let oversized = ledger.set(&empty, &[reg(&long_key)], &[vec![1]]).unwrap_err();
        assert!(matches!(oversized, LedgerError::OversizedRegisterPart { .. }));

        assert_eq!(ledger.disk_size().unwrap(), 0);
    }

    #[test]
    fn test_unknown_commitment_not_found() {
        let temp = TempDir::new().unwrap();
        let ledger = open(temp.path());
        let bogus = crate::hash::sha3(b"bogus");
        assert!(matches!(
            ledger.get(&bogus, &[reg("a")]),
            Err(LedgerError::CommitmentNotFound { .. })
        ));
        assert!(matches!(
            ledger.set(&bogus, &[reg("a")], &[vec![1]]),
            Err(LedgerError::CommitmentNotFound { .. })
        ));
        assert_eq!(ledger.disk_size().unwrap(), 0);
    }

    #[test]
    fn test_reopen_restores_state() {
        let temp = TempDir::new().unwrap();
        let ids = vec![reg("x")];
        let c = {
            let ledger = open(temp.path());
            let empty = ledger.empty_state_commitment();
            ledger.set(&empty, &ids, &[b"persisted".to_vec()]).unwrap()
        };
        let ledger = open(temp.path());
        assert_eq!(ledger.get(&c, &ids).unwrap(), vec![b"persisted".to_vec()]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            trie_height: 12,
            ..Config::testing()
        };
        assert!(matches!(Ledger::open(temp.path(), config), Err(LedgerError::InvalidConfig(_))));
    }

    #[test]
    fn test_prove_verifies() {
        let temp = TempDir::new().unwrap();
        let ledger = open(temp.path());
        let empty = ledger.empty_state_commitment();
        let ids = vec![reg("p"), reg("q")];
        let c = ledger.set(&empty, &ids[..1], &[b"proven".to_vec()]).unwrap();

        let bytes = ledger.prove(&c, &ids).unwrap();
        let paths = ledger.paths(&ids).unwrap();
        assert!(crate::trie::verify_encoded(&bytes, &paths, &c));
        assert!(!crate::trie::verify_encoded(&bytes, &paths, &empty));

        let proof = BatchProof::decode(&bytes).unwrap();
        assert_eq!(proof.values(), vec![b"proven".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_compactor_start_stop() {
        let temp = TempDir::new().unwrap();
        let ledger = open(temp.path());
        ledger.start_compactor().unwrap();
        ledger.start_compactor().unwrap();
        assert!(ledger.stop_compactor().is_some());
        assert!(ledger.stop_compactor().is_none());
        ledger.close().unwrap();
    }

    #[test]
    fn test_replay_drops_deleted_tries() {
        let forest = Forest::new(256, 2, Arc::new(crate::forest::IgnoreEvictions));
        let mut replay = ForestReplay { forest: &forest };
        let mut parent = forest.empty_root_hash();
        let mut deleted = Vec::new();
        let mut largest = 0;
        for i in 0..50u8 {
            let paths = vec![TriePath::from_prefix(&[i]).unwrap()];
            replay.on_update(0, parent, paths, vec![vec![i + 1]]).unwrap();
            parent = *forest.cached_commitments().last().unwrap();
            largest = largest.max(forest.len());
            // what a live eviction would have logged after this update
            if forest.len() > 2 {
                let lru = forest.cached_commitments()[0];
                replay.on_delete(0, lru).unwrap();
                deleted.push(lru);
            }
        }
        assert_eq!(largest, 3);
        assert_eq!(forest.len(), 2);

        let orphan = vec![TriePath::from_prefix(&[200]).unwrap()];
        let err = replay.on_update(1, deleted[0], orphan, vec![vec![1]]).unwrap_err();
        assert!(matches!(err, LedgerError::ReplayFailed { segment: 1, .. }));
    }
}
