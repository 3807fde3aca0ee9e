//! RegStore Core: fork-aware register storage
//!
//! Execution state is a forest of persistent sparse Merkle tries. Each
//! update derives a new trie from a parent commitment, sharing every
//! untouched subtree, so any number of forks can be read and proven side by
//! side.
//!
//! # Architecture
//!
//! - **Read path**: locate the trie by commitment, traverse without locks
//! - **Write path**: WAL-first (durable), then publish the new trie
//! - **Forest**: LRU-bounded; every eviction is logged before it happens
//! - **Compactor**: background checkpoints so startup replays only the tail
//!   of the log
//!
//! ```no_run
//! use regstore_core::{Config, Ledger, RegisterId};
//!
//! # fn main() -> regstore_core::LedgerResult<()> {
//! let ledger = Ledger::open("/var/lib/regstore", Config::default())?;
//! let ids = [RegisterId::new("owner", "", "balance")];
//! let root = ledger.set(&ledger.empty_state_commitment(), &ids, &[b"100".to_vec()])?;
//! assert_eq!(ledger.get(&root, &ids)?, vec![b"100".to_vec()]);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod compactor;
pub mod config;
pub mod error;
pub mod forest;
pub mod format;
pub mod hash;
pub mod ledger;
pub mod path;
pub mod platform_durability;
pub mod trie;
pub mod wal;

// Re-export key types for convenience
pub use checkpoint::Checkpointer;
pub use compactor::{CompactorHandle, CompactorStats};
pub use config::Config;
pub use error::{ErrorCategory, LedgerError, LedgerResult};
pub use forest::{EvictionObserver, Forest};
pub use hash::Hash;
pub use ledger::Ledger;
pub use path::{Path, PathEncoder, RegisterId};
pub use trie::{verify_batch_proof, verify_encoded, BatchProof, ProofEntry, ProofTerminal, StateCommitment, Trie};
pub use wal::Wal;
