//! Forest: LRU-bounded set of tries keyed by state commitment
//!
//! The forest only guards its own bookkeeping: lookups and insertions take a
//! short mutex, while the tries handed out are immutable and can be read
//! without any lock.
//!
//! Before a trie is evicted the [`EvictionObserver`] is called. Insertions
//! are serialized by their own mutex and the map lock is released while the
//! observer runs, so lookups never wait on it. If the observer fails,
//! nothing is evicted and the insertion that needed the space fails with
//! the observer's error.
//!
//! The empty trie is always resolvable and never cached, so it can't be
//! evicted and never produces an eviction record.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::path::Path;
use crate::trie::{BatchProof, StateCommitment, Trie};

/// Notified synchronously before a trie leaves the forest.
pub trait EvictionObserver: Send + Sync {
    fn on_evict(&self, commitment: &StateCommitment, trie: &Trie) -> LedgerResult<()>;
}

/// Observer that accepts every eviction.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreEvictions;

impl EvictionObserver for IgnoreEvictions {
    fn on_evict(&self, _commitment: &StateCommitment, _trie: &Trie) -> LedgerResult<()> {
        Ok(())
    }
}

/// Bounded cache of tries.
pub struct Forest {
    height: u16,
    capacity: usize,
    empty: Arc<Trie>,
    /// Least recently used at the tail. Capacity is enforced here, not by
    /// the cache, so replay can run over it temporarily.
    tries: Mutex<LruCache<StateCommitment, Arc<Trie>>>,
    /// Held by insertions and evictions, never by lookups.
    insert: Mutex<()>,
    observer: Arc<dyn EvictionObserver>,
}

impl Forest {
    pub fn new(height: u16, capacity: usize, observer: Arc<dyn EvictionObserver>) -> Self {
        Self {
            height,
            capacity,
            empty: Arc::new(Trie::empty(height)),
            tries: Mutex::new(LruCache::unbounded()),
            insert: Mutex::new(()),
            observer,
        }
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Root hash of the trie with no registers.
    pub fn empty_root_hash(&self) -> StateCommitment {
        self.empty.root_hash()
    }

    /// Look up a trie and mark it most recently used.
    pub fn get(&self, commitment: &StateCommitment) -> Option<Arc<Trie>> {
        if *commitment == self.empty_root_hash() {
            return Some(Arc::clone(&self.empty));
        }
        let mut tries = self.tries.lock();
        tries.get(commitment).cloned()
    }

    /// Like [`Forest::get`] but reports a miss as an error.
    pub fn require(&self, commitment: &StateCommitment) -> LedgerResult<Arc<Trie>> {
        self.get(commitment)
            .ok_or(LedgerError::CommitmentNotFound { commitment: *commitment })
    }

    pub fn contains(&self, commitment: &StateCommitment) -> bool {
        *commitment == self.empty_root_hash() || self.tries.lock().contains(commitment)
    }

    /// Insert a trie, evicting least recently used tries to stay in capacity.
    pub fn put(&self, trie: Arc<Trie>) -> LedgerResult<()> {
        let commitment = trie.root_hash();
        if commitment == self.empty_root_hash() {
            return Ok(());
        }
        let _insert = self.insert.lock();
        if self.tries.lock().get(&commitment).is_some() {
            return Ok(());
        }
        while self.len() >= self.capacity {
            self.evict_one()?;
        }
        self.tries.lock().put(commitment, trie);
        Ok(())
    }

    /// Insert without evicting. Used while replaying the log, where the
    /// log's own delete records decide what leaves.
    pub(crate) fn put_unbounded(&self, trie: Arc<Trie>) {
        let commitment = trie.root_hash();
        if commitment == self.empty_root_hash() {
            return;
        }
        let mut tries = self.tries.lock();
        if tries.get(&commitment).is_none() {
            tries.put(commitment, trie);
        }
    }

    /// Evict until the forest is within capacity. Returns how many left.
    pub fn enforce_capacity(&self) -> LedgerResult<usize> {
        let _insert = self.insert.lock();
        let mut evicted = 0;
        while self.len() > self.capacity {
            self.evict_one()?;
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Evict the least recently used trie. Caller holds `insert`.
    ///
    /// The victim stays readable while the observer runs; a lookup that
    /// promotes it in the meantime does not save it.
    fn evict_one(&self) -> LedgerResult<()> {
        let victim = self.tries.lock().peek_lru().map(|(c, t)| (*c, Arc::clone(t)));
        let Some((commitment, trie)) = victim else {
            return Ok(());
        };
        self.observer.on_evict(&commitment, &trie)?;
        self.tries.lock().pop(&commitment);
        debug!(commitment = %commitment, "evicted trie from forest");
        Ok(())
    }

    /// Drop a trie without notifying the observer.
    pub fn remove(&self, commitment: &StateCommitment) -> Option<Arc<Trie>> {
        self.tries.lock().pop(commitment)
    }

    /// Apply an update on top of `parent` and insert the result.
    pub fn update(
        &self,
        parent: &StateCommitment,
        paths: &[Path],
        values: &[Vec<u8>],
    ) -> LedgerResult<Arc<Trie>> {
        let base = self.require(parent)?;
        let next = Arc::new(base.update(paths, values)?);
        self.put(Arc::clone(&next))?;
        Ok(next)
    }

    /// Read `paths` from the trie at `commitment`.
    pub fn read(&self, commitment: &StateCommitment, paths: &[Path]) -> LedgerResult<Vec<Vec<u8>>> {
        Ok(self.require(commitment)?.read(paths))
    }

    /// Build a batch proof for `paths` at `commitment`.
    pub fn proofs(&self, commitment: &StateCommitment, paths: &[Path]) -> LedgerResult<BatchProof> {
        Ok(self.require(commitment)?.prove(paths))
    }

    /// Number of cached tries (the empty trie is not counted).
    pub fn len(&self) -> usize {
        self.tries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tries.lock().is_empty()
    }

    /// Cached commitments, least recently used first.
    pub fn cached_commitments(&self) -> Vec<StateCommitment> {
        self.tries.lock().iter().rev().map(|(c, _)| *c).collect()
    }

    /// Handles to every cached trie, least recently used first.
    pub fn snapshot(&self) -> Vec<Arc<Trie>> {
        self.tries.lock().iter().rev().map(|(_, t)| Arc::clone(t)).collect()
    }
}

impl std::fmt::Debug for Forest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forest")
            .field("height", &self.height)
            .field("capacity", &self.capacity)
            .field("tries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Recorder {
        evicted: PlMutex<Vec<StateCommitment>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl EvictionObserver for Recorder {
        fn on_evict(&self, commitment: &StateCommitment, _trie: &Trie) -> LedgerResult<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(LedgerError::Io {
                    path: None,
                    kind: std::io::ErrorKind::Other,
                    message: "disk full".into(),
                });
            }
            self.evicted.lock().push(*commitment);
            Ok(())
        }
    }

    fn path(b: u8) -> Path {
        Path::from_prefix(&[b]).unwrap()
    }

    fn grow(forest: &Forest, n: u8) -> Vec<StateCommitment> {
        let mut parent = forest.empty_root_hash();
        let mut out = Vec::new();
        for i in 0..n {
            let t = forest.update(&parent, &[path(i)], &[vec![i + 1]]).unwrap();
            parent = t.root_hash();
            out.push(parent);
        }
        out
    }

    #[test]
    fn test_empty_trie_always_available() {
        let forest = Forest::new(256, 1, Arc::new(IgnoreEvictions));
        let empty = forest.empty_root_hash();
        assert!(forest.get(&empty).is_some());
        assert!(forest.contains(&empty));
        assert_eq!(forest.len(), 0);
        assert_eq!(forest.read(&empty, &[path(1)]).unwrap(), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_lru_eviction_calls_observer() {
        let recorder = Arc::new(Recorder::default());
        let forest = Forest::new(256, 2, recorder.clone());
        let roots = grow(&forest, 3);
        assert_eq!(forest.len(), 2);
        assert_eq!(*recorder.evicted.lock(), vec![roots[0]]);
        assert!(forest.get(&roots[0]).is_none());
    }

    #[test]
    fn test_get_refreshes_recency() {
        let recorder = Arc::new(Recorder::default());
        let forest = Forest::new(256, 2, recorder.clone());
        let roots = grow(&forest, 2);
        forest.get(&roots[0]).unwrap();
        let empty = forest.empty_root_hash();
        let t = forest.update(&empty, &[path(9)], &[vec![9]]).unwrap();
        assert_eq!(*recorder.evicted.lock(), vec![roots[1]]);
        assert_eq!(forest.cached_commitments(), vec![roots[0], t.root_hash()]);
    }

    #[test]
    fn test_failed_observer_fails_insertion() {
        let recorder = Arc::new(Recorder::default());
        let forest = Forest::new(256, 1, recorder.clone());
        let roots = grow(&forest, 1);
        recorder.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        let err = forest.update(&roots[0], &[path(5)], &[vec![5]]).unwrap_err();
        assert!(matches!(err, LedgerError::Io { .. }));
        assert_eq!(forest.cached_commitments(), roots);
    }

    #[test]
    fn test_unknown_commitment_not_found() {
        let forest = Forest::new(256, 4, Arc::new(IgnoreEvictions));
        let missing = crate::hash::sha3(b"nope");
        let err = forest.read(&missing, &[path(1)]).unwrap_err();
        assert!(matches!(err, LedgerError::CommitmentNotFound { .. }));
    }

    #[test]
    fn test_unbounded_then_enforce() {
        let recorder = Arc::new(Recorder::default());
        let forest = Forest::new(256, 2, recorder.clone());
        let base = Arc::new(Trie::empty(256));
        for i in 0..4u8 {
            forest.put_unbounded(Arc::new(base.update(&[path(i)], &[vec![1]]).unwrap()));
        }
        assert_eq!(forest.len(), 4);
        assert_eq!(forest.enforce_capacity().unwrap(), 2);
        assert_eq!(forest.len(), 2);
        assert_eq!(recorder.evicted.lock().len(), 2);
    }

    #[test]
    fn test_concurrent_reads_during_inserts() {
        let forest = Arc::new(Forest::new(256, 8, Arc::new(IgnoreEvictions)));
        let roots = grow(&forest, 4);
        let reader = {
            let forest = Arc::clone(&forest);
            let root = roots[3];
            std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(t) = forest.get(&root) {
                        assert_eq!(t.read(&[path(0)]), vec![vec![1]]);
                    }
                }
            })
        };
        let mut parent = roots[3];
        for i in 10..60u8 {
            parent = forest.update(&parent, &[path(i)], &[vec![i]]).unwrap().root_hash();
        }
        reader.join().unwrap();
    }

    struct SlowObserver {
        started: PlMutex<Option<std::sync::mpsc::Sender<()>>>,
    }

    impl EvictionObserver for SlowObserver {
        fn on_evict(&self, _commitment: &StateCommitment, _trie: &Trie) -> LedgerResult<()> {
            if let Some(tx) = self.started.lock().take() {
                tx.send(()).unwrap();
            }
            std::thread::sleep(std::time::Duration::from_millis(300));
            Ok(())
        }
    }

    #[test]
    fn test_lookups_not_blocked_by_observer() {
        let (tx, rx) = std::sync::mpsc::channel();
        let observer = Arc::new(SlowObserver { started: PlMutex::new(Some(tx)) });
        let forest = Arc::new(Forest::new(256, 2, observer));
        let base = Arc::new(Trie::empty(256));
        let tries: Vec<Arc<Trie>> = (0..3u8)
            .map(|i| Arc::new(base.update(&[path(i)], &[vec![1]]).unwrap()))
            .collect();
        forest.put(Arc::clone(&tries[0])).unwrap();
        forest.put(Arc::clone(&tries[1])).unwrap();

        let inserter = {
            let forest = Arc::clone(&forest);
            let third = Arc::clone(&tries[2]);
            std::thread::spawn(move || forest.put(third).unwrap())
        };
        rx.recv().unwrap();

        let started = std::time::Instant::now();
        assert!(forest.get(&tries[1].root_hash()).is_some());
        // the victim stays readable until its eviction completes
        assert!(forest.contains(&tries[0].root_hash()));
        assert!(started.elapsed() < std::time::Duration::from_millis(150));

        inserter.join().unwrap();
        assert!(!forest.contains(&tries[0].root_hash()));
        assert_eq!(forest.len(), 2);
    }
}
