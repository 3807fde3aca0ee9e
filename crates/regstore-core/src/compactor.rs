//! Compactor: background checkpoint thread
//!
//! Runs [`Checkpointer::checkpoint_now`] on a fixed cadence. A failed cycle
//! is logged and counted, and the next cycle simply tries again; foreground
//! reads and writes never see compaction errors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::checkpoint::Checkpointer;
use crate::error::{LedgerError, LedgerResult};

/// Longest the loop sleeps before re-checking the stop flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// Counters shared with the compactor thread.
#[derive(Debug, Default)]
pub struct CompactorStats {
    cycles: AtomicU64,
    checkpoints: AtomicU64,
    failures: AtomicU64,
    last_checkpoint: AtomicU64,
}

impl CompactorStats {
    /// Cycles run, whether or not they wrote anything.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Checkpoint files written.
    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Cycles that ended in an error.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Index of the last checkpoint this compactor wrote.
    pub fn last_checkpoint(&self) -> Option<u64> {
        match self.checkpoints_written() {
            0 => None,
            _ => Some(self.last_checkpoint.load(Ordering::Relaxed)),
        }
    }

    fn record(&self, outcome: &LedgerResult<Option<u64>>) {
        match outcome {
            Ok(Some(index)) => {
                self.last_checkpoint.store(*index, Ordering::Relaxed);
                self.checkpoints.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running compactor thread.
/// Dropping it stops the thread and waits for the current cycle to finish.
pub struct CompactorHandle {
    shutdown: Arc<AtomicBool>,
    stats: Arc<CompactorStats>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CompactorHandle {
    /// Stop the thread and wait for it. Returns the final counters.
    pub fn shutdown(mut self) -> Arc<CompactorStats> {
        self.stop();
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> &Arc<CompactorStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("compactor thread panicked");
            }
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the compactor thread.
pub fn start_compactor(checkpointer: Arc<Checkpointer>, interval: Duration) -> LedgerResult<CompactorHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(CompactorStats::default());
    let dir = checkpointer.dir().to_path_buf();

    let thread = {
        let shutdown = Arc::clone(&shutdown);
        let stats = Arc::clone(&stats);
        thread::Builder::new()
            .name("regstore-compactor".to_string())
            .spawn(move || compactor_loop(&checkpointer, interval, &shutdown, &stats))
            .map_err(|e| LedgerError::Io {
                path: Some(dir),
                kind: e.kind(),
                message: format!("Failed to spawn compactor thread: {}", e),
            })?
    };

    Ok(CompactorHandle {
        shutdown,
        stats,
        thread: Some(thread),
    })
}

fn compactor_loop(checkpointer: &Checkpointer, interval: Duration, shutdown: &AtomicBool, stats: &CompactorStats) {
    debug!(interval_ms = interval.as_millis() as u64, "compactor started");
    loop {
        let wake_time = Instant::now() + interval;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                debug!(cycles = stats.cycles(), "compactor stopped");
                return;
            }
            thread::sleep(SHUTDOWN_POLL.min(wake_time.saturating_duration_since(Instant::now())));
        }
        if shutdown.load(Ordering::Acquire) {
            debug!(cycles = stats.cycles(), "compactor stopped");
            return;
        }

        let outcome = checkpointer.checkpoint_now();
        if let Err(e) = &outcome {
            warn!(error = %e, "checkpoint cycle failed, retrying next cycle");
        }
        stats.record(&outcome);
    }
}
