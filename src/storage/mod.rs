//! Storage module for persisting state between passes
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Per-source watermarks (write-forward only)
//! - The version of the last successful pass
//! - Run tracking with final counters

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::UpdateError;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::fmt;
use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(UpdateError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, UpdateError> {
    SqliteStorage::new(path)
}

/// Final counters of a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub found: u64,
    pub downloaded: u64,
    pub already_exists: u64,
    pub linked: u64,
    pub failed: u64,
    pub bytes_downloaded: u64,
    pub bytes_saved: u64,
}

/// Represents one pipeline pass
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub version: String,
    pub status: RunStatus,
    pub counters: RunCounters,
}

/// Status of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_db_string()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        RunStatus::from_db_string(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown run status '{}'", s).into()))
    }
}
