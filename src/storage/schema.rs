//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the tumblr-update database.

/// Metadata key holding the version of the last successful pass
pub const VERSION_KEY: &str = "version";

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Highest post ID fully processed per source
CREATE TABLE IF NOT EXISTS watermarks (
    source TEXT PRIMARY KEY,
    last_post_id TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Free-form key/value pairs (the program version lives here)
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per pipeline pass
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    version TEXT NOT NULL,
    status TEXT NOT NULL,
    found INTEGER NOT NULL DEFAULT 0,
    downloaded INTEGER NOT NULL DEFAULT 0,
    already_exists INTEGER NOT NULL DEFAULT 0,
    linked INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    bytes_downloaded INTEGER NOT NULL DEFAULT 0,
    bytes_saved INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
