//! Segmented write-ahead log
//!
//! Write ordering for every record:
//! 1. serialize the record (with CRC32C)
//! 2. append it whole to the active segment
//! 3. `durable_sync()` the segment
//! 4. return; only now may the caller touch the forest
//!
//! Segments are files named by an 8-digit decimal index. Once an append
//! leaves the active segment at or above the size threshold, the segment is
//! sealed and the next one is created. Sealed segments are never written
//! again.
//!
//! On open, a torn or corrupt tail in the newest segment is cut off. Damage
//! that is followed by a valid record, or damage in a sealed segment, can't
//! be the tail of an interrupted append and is reported as corruption.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{LedgerError, LedgerResult};
use crate::format::{deserialize_record, serialize_delete, serialize_update, WalRecord, MAGIC_ARRAY};
use crate::path::Path as TriePath;
use crate::platform_durability::{durable_sync, sync_directory};
use crate::trie::StateCommitment;

/// Digits in a segment file name.
pub const SEGMENT_NAME_DIGITS: usize = 8;

/// File name of segment `index`.
pub fn segment_file_name(index: u64) -> String {
    format!("{:0width$}", index, width = SEGMENT_NAME_DIGITS)
}

/// Parse a segment file name back to its index.
pub fn parse_segment_name(name: &str) -> Option<u64> {
    if name.len() == SEGMENT_NAME_DIGITS && name.bytes().all(|b| b.is_ascii_digit()) {
        name.parse().ok()
    } else {
        None
    }
}

/// Indices of every segment in `dir`, ascending.
pub fn list_segments(dir: &Path) -> LedgerResult<Vec<u64>> {
    let entries = std::fs::read_dir(dir).map_err(|e| LedgerError::io_at(dir, e, "Failed to read WAL directory"))?;
    let mut indices = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LedgerError::io_at(dir, e, "Failed to read directory entry"))?;
        if let Some(index) = entry.file_name().to_str().and_then(parse_segment_name) {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

/// Receives records in log order during replay.
pub trait ReplayHandler {
    fn on_update(
        &mut self,
        segment: u64,
        parent: StateCommitment,
        paths: Vec<TriePath>,
        values: Vec<Vec<u8>>,
    ) -> LedgerResult<()>;

    fn on_delete(&mut self, segment: u64, commitment: StateCommitment) -> LedgerResult<()>;
}

/// Counters from one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub segments: u64,
    pub updates: u64,
    pub deletes: u64,
}

/// Appends to the active segment. Callers serialize access through [`Wal`].
pub struct WalWriter {
    file: File,
    path: PathBuf,
    /// Current segment size in bytes (tracked to avoid stat calls)
    size: u64,
    index: u64,
    dir: PathBuf,
    segment_size: u64,
}

impl WalWriter {
    fn open_segment(dir: &Path, index: u64, segment_size: u64) -> LedgerResult<Self> {
        let path = dir.join(segment_file_name(index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::io_at(&path, e, "Failed to open WAL segment"))?;
        let size = file
            .metadata()
            .map_err(|e| LedgerError::io_at(&path, e, "Failed to stat WAL segment"))?
            .len();
        Ok(Self {
            file,
            path,
            size,
            index,
            dir: dir.to_path_buf(),
            segment_size,
        })
    }

    /// Append one serialized record, sync, and seal the segment if full.
    ///
    /// Once the record is synced the append has succeeded. A failed seal is
    /// logged and retried before the next append writes anything.
    fn append_durable(&mut self, bytes: &[u8]) -> LedgerResult<()> {
        if self.size >= self.segment_size {
            self.rotate()?;
        }
        let written = self
            .file
            .write_all(bytes)
            .map_err(|e| LedgerError::io_at(&self.path, e, "WAL write failed"))
            .and_then(|()| {
                durable_sync(&self.file).map_err(|e| LedgerError::io_at(&self.path, e, "WAL durable_sync failed"))
            });
        if let Err(e) = written {
            // never leave a partial record in front of the next append
            if let Err(cut) = self.file.set_len(self.size) {
                warn!(path = %self.path.display(), error = %cut, "failed to roll back partial WAL append");
            }
            return Err(e);
        }
        self.size += bytes.len() as u64;

        if self.size >= self.segment_size {
            if let Err(e) = self.rotate() {
                warn!(segment = self.index, error = %e, "failed to seal full WAL segment, retrying on next append");
            }
        }
        Ok(())
    }

    /// Seal the active segment and start the next one.
    fn rotate(&mut self) -> LedgerResult<()> {
        durable_sync(&self.file).map_err(|e| LedgerError::io_at(&self.path, e, "WAL sync before rotation failed"))?;
        let (sealed, sealed_size) = (self.index, self.size);
        let next = Self::open_segment(&self.dir, sealed + 1, self.segment_size)?;
        sync_directory(&self.dir).map_err(|e| LedgerError::io_at(&self.dir, e, "Failed to sync WAL directory"))?;
        *self = next;
        debug!(segment = sealed, size = sealed_size, "sealed WAL segment");
        Ok(())
    }
}

/// The write-ahead log of one ledger directory.
pub struct Wal {
    dir: PathBuf,
    path_width: usize,
    writer: Mutex<WalWriter>,
}

impl Wal {
    /// Open the log in `dir`, repairing a torn tail in the newest segment.
    ///
    /// The active segment index is at least `min_active`, so appends never
    /// land in a segment an existing checkpoint already claims to cover.
    pub fn open(dir: &Path, config: &Config, min_active: u64) -> LedgerResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| LedgerError::io_at(dir, e, "Failed to create WAL directory"))?;

        let segments = list_segments(dir)?;
        let writer = match segments.last() {
            Some(&newest) if newest >= min_active => {
                repair_tail(&dir.join(segment_file_name(newest)))?;
                WalWriter::open_segment(dir, newest, config.segment_size_bytes)?
            }
            _ => {
                let w = WalWriter::open_segment(dir, min_active, config.segment_size_bytes)?;
                sync_directory(dir).map_err(|e| LedgerError::io_at(dir, e, "Failed to sync WAL directory"))?;
                w
            }
        };
        info!(
            dir = %dir.display(),
            segments = segments.len(),
            active = writer.index,
            "opened WAL"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            path_width: config.path_bytes(),
            writer: Mutex::new(writer),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably record an update. Returns once the record survives a crash.
    pub fn record_update(
        &self,
        parent: &StateCommitment,
        paths: &[TriePath],
        values: &[Vec<u8>],
    ) -> LedgerResult<()> {
        let bytes = serialize_update(parent, self.path_width, paths, values)?;
        self.writer.lock().append_durable(&bytes)
    }

    /// Durably record that `commitment` left the forest.
    pub fn record_delete(&self, commitment: &StateCommitment) -> LedgerResult<()> {
        let bytes = serialize_delete(commitment);
        self.writer.lock().append_durable(&bytes)
    }

    /// Seal the active segment if it holds any record.
    ///
    /// Returns the index of the newest sealed segment afterwards, or `None`
    /// if no segment has been sealed yet.
    pub fn rotate_if_nonempty(&self) -> LedgerResult<Option<u64>> {
        let mut writer = self.writer.lock();
        if writer.size > 0 {
            let sealed = writer.index;
            writer.rotate()?;
            return Ok(Some(sealed));
        }
        Ok(writer.index.checked_sub(1))
    }

    /// Index of the segment currently receiving appends.
    pub fn active_segment(&self) -> u64 {
        self.writer.lock().index
    }

    /// Bytes in the active segment.
    pub fn active_size(&self) -> u64 {
        self.writer.lock().size
    }

    /// Oldest and newest segment indices on disk.
    pub fn segment_range(&self) -> LedgerResult<(u64, u64)> {
        let segments = list_segments(&self.dir)?;
        let active = self.active_segment();
        Ok((segments.first().copied().unwrap_or(active), active))
    }

    /// Sync the active segment without appending.
    pub fn sync(&self) -> LedgerResult<()> {
        let writer = self.writer.lock();
        durable_sync(&writer.file).map_err(|e| LedgerError::io_at(&writer.path, e, "WAL sync failed"))
    }

    /// Feed every record in segments `from..` to `handler`, in log order.
    ///
    /// Must not run concurrently with appends.
    pub fn replay<H: ReplayHandler>(&self, from: u64, handler: &mut H) -> LedgerResult<ReplayStats> {
        let mut stats = ReplayStats::default();
        let segments: Vec<u64> = list_segments(&self.dir)?.into_iter().filter(|i| *i >= from).collect();
        if let Some(&first) = segments.first() {
            if first != from {
                return Err(LedgerError::ReplayFailed {
                    segment: from,
                    reason: format!("segment {} is missing, oldest available is {}", from, first),
                });
            }
        }
        for pair in segments.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(LedgerError::ReplayFailed {
                    segment: pair[0] + 1,
                    reason: format!("gap between segments {} and {}", pair[0], pair[1]),
                });
            }
        }

        for index in segments {
            let path = self.dir.join(segment_file_name(index));
            let scan = scan_segment(&path)?;
            if let Some((offset, reason)) = scan.damage {
                // the tail of the newest segment was repaired at open
                return Err(LedgerError::WalCorrupted { path, offset, reason });
            }
            for record in scan.records {
                match record {
                    WalRecord::Update { parent, paths, values } => {
                        handler.on_update(index, parent, paths, values)?;
                        stats.updates += 1;
                    }
                    WalRecord::Delete { commitment } => {
                        handler.on_delete(index, commitment)?;
                        stats.deletes += 1;
                    }
                }
            }
            stats.segments += 1;
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("active", &self.active_segment())
            .finish()
    }
}

/// Records of one segment up to the first damaged byte.
struct SegmentScan {
    records: Vec<WalRecord>,
    valid_len: u64,
    /// Offset and reason of a damaged tail, if any.
    damage: Option<(u64, String)>,
}

fn scan_segment(path: &Path) -> LedgerResult<SegmentScan> {
    let buffer = std::fs::read(path).map_err(|e| LedgerError::io_at(path, e, "Failed to read WAL segment"))?;
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < buffer.len() {
        match deserialize_record(&buffer[offset..]) {
            Ok((record, used)) => {
                records.push(record);
                offset += used;
            }
            Err(e) => {
                if let Some(next) = find_next_record(&buffer, offset + 1) {
                    return Err(LedgerError::WalCorrupted {
                        path: path.to_path_buf(),
                        offset: offset as u64,
                        reason: format!("{} (valid record follows at offset {})", e, next),
                    });
                }
                return Ok(SegmentScan {
                    records,
                    valid_len: offset as u64,
                    damage: Some((offset as u64, e.to_string())),
                });
            }
        }
    }
    Ok(SegmentScan {
        records,
        valid_len: offset as u64,
        damage: None,
    })
}

/// Offset of the next complete, checksummed record at or after `start`.
fn find_next_record(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3))
        .filter(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
        .find(|&i| deserialize_record(&buffer[i..]).is_ok())
}

/// Truncate a damaged tail off `path`.
fn repair_tail(path: &Path) -> LedgerResult<()> {
    let scan = scan_segment(path)?;
    if let Some((offset, reason)) = scan.damage {
        warn!(
            path = %path.display(),
            offset,
            reason = %reason,
            "truncating torn WAL tail"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| LedgerError::io_at(path, e, "Failed to open WAL segment for repair"))?;
        file.set_len(scan.valid_len)
            .map_err(|e| LedgerError::io_at(path, e, "Failed to truncate WAL segment"))?;
        durable_sync(&file).map_err(|e| LedgerError::io_at(path, e, "Failed to sync repaired WAL segment"))?;
    }
    Ok(())
}
