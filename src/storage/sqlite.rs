//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::state::PostId;
use crate::storage::schema::{initialize_schema, VERSION_KEY};
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{RunCounters, RunRecord, RunStatus};
use crate::UpdateError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;

const RUN_COLUMNS: &str = "id, started_at, finished_at, version, status, found, downloaded, \
                           already_exists, linked, failed, bytes_downloaded, bytes_saved";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file; missing parent directories are created
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(UpdateError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, UpdateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| UpdateError::filesystem(parent, e))?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, UpdateError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn parse_watermark(source: &str, value: &str) -> StorageResult<PostId> {
    PostId::parse(value).map_err(|_| StorageError::InvalidWatermark {
        source_name: source.to_string(),
        value: value.to_string(),
    })
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        version: row.get(3)?,
        status: row.get(4)?,
        counters: RunCounters {
            found: row.get::<_, i64>(5)? as u64,
            downloaded: row.get::<_, i64>(6)? as u64,
            already_exists: row.get::<_, i64>(7)? as u64,
            linked: row.get::<_, i64>(8)? as u64,
            failed: row.get::<_, i64>(9)? as u64,
            bytes_downloaded: row.get::<_, i64>(10)? as u64,
            bytes_saved: row.get::<_, i64>(11)? as u64,
        },
    })
}

impl Storage for SqliteStorage {
    // ===== Watermarks =====

    fn load_watermark(&self, source: &str) -> StorageResult<Option<PostId>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT last_post_id FROM watermarks WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()?;

        value.map(|v| parse_watermark(source, &v)).transpose()
    }

    fn load_watermarks(&self) -> StorageResult<HashMap<String, PostId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT source, last_post_id FROM watermarks")?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut watermarks = HashMap::new();
        for row in rows {
            let (source, value) = row?;
            let id = parse_watermark(&source, &value)?;
            watermarks.insert(source, id);
        }

        Ok(watermarks)
    }

    fn save_watermark(&mut self, source: &str, id: &PostId) -> StorageResult<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT last_post_id FROM watermarks WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(current) = current {
            if *id <= parse_watermark(source, &current)? {
                return Ok(false);
            }
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO watermarks (source, last_post_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(source) DO UPDATE SET
                last_post_id = excluded.last_post_id,
                updated_at = excluded.updated_at",
            params![source, id.as_str(), now],
        )?;
        tx.commit()?;

        Ok(true)
    }

    // ===== Metadata =====

    fn load_version(&self) -> StorageResult<Option<String>> {
        let version = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    fn save_version(&mut self, version: &str) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![VERSION_KEY, version],
        )?;
        Ok(())
    }

    // ===== Run Management =====

    fn create_run(&mut self, version: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, version, status) VALUES (?1, ?2, ?3)",
            params![now, version, RunStatus::Running],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        counters: &RunCounters,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, found = ?3, downloaded = ?4,
                already_exists = ?5, linked = ?6, failed = ?7, bytes_downloaded = ?8,
                bytes_saved = ?9
             WHERE id = ?10",
            params![
                status,
                now,
                counters.found as i64,
                counters.downloaded as i64,
                counters.already_exists as i64,
                counters.linked as i64,
                counters.failed as i64,
                counters.bytes_downloaded as i64,
                counters.bytes_saved as i64,
                run_id
            ],
        )?;

        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        self.conn
            .query_row(&sql, params![run_id], read_run)
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let sql = format!("SELECT {} FROM runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS);
        let run = self.conn.query_row(&sql, [], read_run).optional()?;
        Ok(run)
    }

    fn list_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>> {
        let sql = format!("SELECT {} FROM runs ORDER BY id DESC LIMIT ?1", RUN_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params![limit as i64], read_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_in_memory() {
        let storage = SqliteStorage::new_in_memory();
        assert!(storage.is_ok());
    }

    #[test]
    fn test_watermark_missing_is_none() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        assert_eq!(storage.load_watermark("demo").unwrap(), None);
        assert!(storage.load_watermarks().unwrap().is_empty());
    }

    #[test]
    fn test_watermark_write_forward_only() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();

        assert!(storage.save_watermark("demo", &PostId::from(100)).unwrap());
        assert!(storage.save_watermark("demo", &PostId::from(150)).unwrap());

        // Lower and equal values are refused
        assert!(!storage.save_watermark("demo", &PostId::from(120)).unwrap());
        assert!(!storage.save_watermark("demo", &PostId::from(150)).unwrap());

        assert_eq!(
            storage.load_watermark("demo").unwrap(),
            Some(PostId::from(150))
        );
    }

    #[test]
    fn test_watermark_compares_numerically() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();

        storage.save_watermark("demo", &PostId::from(99)).unwrap();
        assert!(storage.save_watermark("demo", &PostId::from(1000)).unwrap());
        assert!(!storage.save_watermark("demo", &PostId::from(999)).unwrap());
    }

    #[test]
    fn test_load_watermarks() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        storage.save_watermark("alpha", &PostId::from(10)).unwrap();
        storage.save_watermark("beta", &PostId::from(20)).unwrap();

        let marks = storage.load_watermarks().unwrap();
        assert_eq!(marks.len(), 2);
        assert_eq!(marks["alpha"], PostId::from(10));
        assert_eq!(marks["beta"], PostId::from(20));
    }

    #[test]
    fn test_invalid_stored_watermark() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        storage
            .conn
            .execute(
                "INSERT INTO watermarks (source, last_post_id, updated_at) VALUES ('demo', 'oops', '')",
                [],
            )
            .unwrap();

        assert!(matches!(
            storage.load_watermark("demo"),
            Err(StorageError::InvalidWatermark { .. })
        ));
    }

    #[test]
    fn test_version_roundtrip() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        assert_eq!(storage.load_version().unwrap(), None);

        storage.save_version("1.3.0").unwrap();
        storage.save_version("1.4.0").unwrap();
        assert_eq!(storage.load_version().unwrap().as_deref(), Some("1.4.0"));
    }

    #[test]
    fn test_run_lifecycle() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.create_run("1.4.0").unwrap();
        assert!(run_id > 0);

        let run = storage.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        let counters = RunCounters {
            found: 12,
            downloaded: 9,
            already_exists: 2,
            linked: 1,
            failed: 0,
            bytes_downloaded: 4096,
            bytes_saved: 512,
        };
        storage
            .finish_run(run_id, RunStatus::Completed, &counters)
            .unwrap();

        let run = storage.get_latest_run().unwrap().unwrap();
        assert_eq!(run.id, run_id);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.version, "1.4.0");
        assert!(run.finished_at.is_some());
        assert_eq!(run.counters, counters);
    }

    #[test]
    fn test_finish_unknown_run() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let result = storage.finish_run(42, RunStatus::Failed, &RunCounters::default());
        assert!(matches!(result, Err(StorageError::RunNotFound(42))));
    }

    #[test]
    fn test_list_runs_newest_first() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let first = storage.create_run("1.4.0").unwrap();
        let second = storage.create_run("1.4.0").unwrap();
        let third = storage.create_run("1.4.0").unwrap();

        let runs = storage.list_runs(2).unwrap();
        let ids: Vec<i64> = runs.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![third, second]);
        assert!(!ids.contains(&first));
    }
}
