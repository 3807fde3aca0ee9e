//! Error types for RegStore operations
//!
//! Every fallible operation returns [`LedgerError`]. Variants carry enough
//! context (file, offset, sizes) to diagnose a failed recovery without
//! re-running it. [`LedgerError::category`] folds them into the coarse
//! classes callers branch on.

use std::path::PathBuf;

use thiserror::Error;

use crate::hash::Hash;

/// Coarse classification of a [`LedgerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller supplied a malformed batch; store unchanged.
    InvalidInput,
    /// Commitment is unknown to the forest.
    NotFound,
    /// A write or sync to disk failed; store unchanged.
    Durability,
    /// On-disk state failed to parse or verify.
    Corruption,
    /// Configuration rejected at open.
    Config,
}

/// RegStore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", .path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// WAL segment is corrupted before its last valid record
    #[error("WAL corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed for a record or file
    #[error("Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Checkpoint file failed to parse
    #[error("Checkpoint {} is corrupted: {reason}", .path.display())]
    CheckpointCorrupted { path: PathBuf, reason: String },

    /// Replaying the log could not reconstruct a trie it refers to
    #[error("WAL replay failed at segment {segment}: {reason}")]
    ReplayFailed { segment: u64, reason: String },

    /// Number of registers and values in a batch differ
    #[error("Batch has {paths} registers but {values} values")]
    MismatchedLengths { paths: usize, values: usize },

    /// Two registers in one update resolve to the same trie path
    #[error("Duplicate path {path} in update batch")]
    DuplicatePath { path: String },

    /// Owner, controller or key exceeds the configured maximum
    #[error("Register {component} too large: {size} bytes exceeds limit of {max} bytes")]
    OversizedRegisterPart {
        component: &'static str,
        size: usize,
        max: usize,
    },

    /// Value exceeds the configured maximum
    #[error("Value too large: {size} bytes exceeds limit of {max} bytes")]
    OversizedValue { size: usize, max: usize },

    /// Path width does not match the trie height
    #[error("Path is {actual} bits wide, trie height is {expected}")]
    PathWidthMismatch { expected: u16, actual: u16 },

    /// Commitment is not held by the forest
    #[error("State commitment {commitment} not found")]
    CommitmentNotFound { commitment: Hash },

    /// Proof bytes failed to decode
    #[error("Malformed proof at byte {offset}: {reason}")]
    MalformedProof { offset: usize, reason: String },

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LedgerError {
    /// Map the error onto the caller-facing taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::MismatchedLengths { .. }
            | LedgerError::DuplicatePath { .. }
            | LedgerError::OversizedRegisterPart { .. }
            | LedgerError::OversizedValue { .. }
            | LedgerError::PathWidthMismatch { .. }
            | LedgerError::MalformedProof { .. } => ErrorCategory::InvalidInput,
            LedgerError::CommitmentNotFound { .. } => ErrorCategory::NotFound,
            LedgerError::Io { .. } => ErrorCategory::Durability,
            LedgerError::WalCorrupted { .. }
            | LedgerError::ChecksumMismatch { .. }
            | LedgerError::CheckpointCorrupted { .. }
            | LedgerError::ReplayFailed { .. } => ErrorCategory::Corruption,
            LedgerError::InvalidConfig(_) => ErrorCategory::Config,
        }
    }

    /// Shorthand for building an [`LedgerError::Io`] with file context.
    pub(crate) fn io_at(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        LedgerError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Convert std::io::Error to LedgerError::Io
impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for RegStore operations
pub type LedgerResult<T> = Result<T, LedgerError>;
