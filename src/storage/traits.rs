//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::PostId;
use crate::storage::{RunCounters, RunRecord, RunStatus};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Invalid watermark for '{source_name}': {value:?}")]
    InvalidWatermark { source_name: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Holds the durable state that survives between passes: per-source
/// watermarks, the version of the last successful pass, and the run history.
pub trait Storage {
    // ===== Watermarks =====

    /// Loads the confirmed watermark of one source
    fn load_watermark(&self, source: &str) -> StorageResult<Option<PostId>>;

    /// Loads every stored watermark keyed by source name
    fn load_watermarks(&self) -> StorageResult<HashMap<String, PostId>>;

    /// Stores a watermark if it is greater than the stored one
    ///
    /// The comparison and the write happen in one transaction, so a
    /// watermark never moves backwards even with several writers.
    ///
    /// # Returns
    ///
    /// Whether the stored watermark advanced
    fn save_watermark(&mut self, source: &str, id: &PostId) -> StorageResult<bool>;

    // ===== Metadata =====

    /// Loads the version recorded by the last successful pass
    fn load_version(&self) -> StorageResult<Option<String>>;

    /// Records the version of a successful pass
    fn save_version(&mut self, version: &str) -> StorageResult<()>;

    // ===== Run Management =====

    /// Creates a new run in the `running` state
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, version: &str) -> StorageResult<i64>;

    /// Sets the final status, finish time and counters of a run
    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        counters: &RunCounters,
    ) -> StorageResult<()>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Lists the most recent runs, newest first
    fn list_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>>;
}
