//! Live counters and run history display
//!
//! This module provides the process-wide counters updated by every task of a
//! pass, the registry of sources still in flight, and the formatting used by
//! the status printer and `--stats`.

use crate::state::{SourceId, SourceState};
use crate::storage::{RunCounters, RunRecord, Storage};
use crate::UpdateError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const UNITS: [&str; 6] = ["KB", "MB", "GB", "TB", "PB", "EB"];

/// Formats a byte count with binary units
///
/// Counts below 1024 are printed as whole bytes; larger counts use two
/// decimals, e.g. `1.01KB` or `1.50EB`.
pub fn byte_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{}B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

/// Process-wide counters shared by all tasks
///
/// Every counter is an independent atomic; the registry of active sources is
/// the only locked part.
#[derive(Debug, Default)]
pub struct GlobalStats {
    pub found: AtomicU64,
    pub downloaded: AtomicU64,
    pub already_exists: AtomicU64,
    pub linked: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    pub bytes_saved: AtomicU64,
    pub bytes_overhead: AtomicU64,
    pub failed: AtomicU64,
    active: Mutex<BTreeMap<SourceId, Arc<SourceState>>>,
}

/// Point-in-time copy of [`GlobalStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub found: u64,
    pub downloaded: u64,
    pub already_exists: u64,
    pub linked: u64,
    pub bytes_downloaded: u64,
    pub bytes_saved: u64,
    pub bytes_overhead: u64,
    pub failed: u64,
}

impl StatsSnapshot {
    /// Counter growth between `earlier` and `self`
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            found: self.found.saturating_sub(earlier.found),
            downloaded: self.downloaded.saturating_sub(earlier.downloaded),
            already_exists: self.already_exists.saturating_sub(earlier.already_exists),
            linked: self.linked.saturating_sub(earlier.linked),
            bytes_downloaded: self.bytes_downloaded.saturating_sub(earlier.bytes_downloaded),
            bytes_saved: self.bytes_saved.saturating_sub(earlier.bytes_saved),
            bytes_overhead: self.bytes_overhead.saturating_sub(earlier.bytes_overhead),
            failed: self.failed.saturating_sub(earlier.failed),
        }
    }
}

impl From<StatsSnapshot> for RunCounters {
    fn from(snapshot: StatsSnapshot) -> Self {
        RunCounters {
            found: snapshot.found,
            downloaded: snapshot.downloaded,
            already_exists: snapshot.already_exists,
            linked: snapshot.linked,
            failed: snapshot.failed,
            bytes_downloaded: snapshot.bytes_downloaded,
            bytes_saved: snapshot.bytes_saved,
        }
    }
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            found: self.found.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            already_exists: self.already_exists.load(Ordering::Relaxed),
            linked: self.linked.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            bytes_overhead: self.bytes_overhead.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Adds a source to the active registry
    pub fn register_source(&self, source: Arc<SourceState>) {
        self.lock_active().insert(source.id(), source);
    }

    /// Removes a source from the active registry
    pub fn deregister_source(&self, id: SourceId) {
        self.lock_active().remove(&id);
    }

    /// Sources still crawling or draining, ordered by ID
    pub fn active_sources(&self) -> Vec<Arc<SourceState>> {
        self.lock_active().values().cloned().collect()
    }

    /// Renders the counters and active sources as a multi-line report
    pub fn status_report(&self) -> String {
        let s = self.snapshot();
        let mut report = String::new();

        report.push_str(&format!(
            "Found: {}  Downloaded: {}  Already existed: {}  Linked: {}  Failed: {}\n",
            s.found, s.downloaded, s.already_exists, s.linked, s.failed
        ));
        report.push_str(&format!(
            "Transferred: {}  Saved by linking: {}  API overhead: {}\n",
            byte_size(s.bytes_downloaded),
            byte_size(s.bytes_saved),
            byte_size(s.bytes_overhead)
        ));

        let active = self.active_sources();
        if !active.is_empty() {
            report.push_str(&format!("Active sources ({}):\n", active.len()));
            for source in active {
                report.push_str(&format!(
                    "  - {} [{}] {}/{} files\n",
                    source.name(),
                    source.status(),
                    source.files_processed(),
                    source.files_found()
                ));
            }
        }

        report
    }

    /// Prints [`status_report`](Self::status_report) to stdout
    pub fn print_status(&self) {
        println!("{}", self.status_report());
    }

    fn lock_active(&self) -> MutexGuard<'_, BTreeMap<SourceId, Arc<SourceState>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Loads the most recent runs from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
/// * `limit` - Maximum number of runs, newest first
pub fn load_run_history(
    storage: &dyn Storage,
    limit: usize,
) -> Result<Vec<RunRecord>, UpdateError> {
    Ok(storage.list_runs(limit)?)
}

/// Prints run history to stdout in a formatted manner
pub fn print_run_history(runs: &[RunRecord]) {
    println!("=== Run History ===\n");

    if runs.is_empty() {
        println!("No runs recorded yet.");
        return;
    }

    for run in runs {
        println!("Run #{} ({}) v{}", run.id, run.status, run.version);
        println!("  Started:  {}", run.started_at);
        println!("  Finished: {}", run.finished_at.as_deref().unwrap_or("-"));
        let c = &run.counters;
        println!(
            "  Found {} | downloaded {} ({}) | existing {} | linked {} ({} saved) | failed {}",
            c.found,
            c.downloaded,
            byte_size(c.bytes_downloaded),
            c.already_exists,
            c.linked,
            byte_size(c.bytes_saved),
            c.failed
        );
        println!();
    }
}
