//! Database schema definitions
//!
//! Tags, rate-limit counters and the job queue share one SQLite file so that
//! every worker process pointed at the same database sees the same state.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Key-value tags (HTTP cache metadata, sessions, incremental markers)
CREATE TABLE IF NOT EXISTS tags (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Expiring counters for rate limiting
CREATE TABLE IF NOT EXISTS counters (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_counters_expires ON counters(expires_at);

-- Pending stage invocations
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL UNIQUE,
    dataset TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    not_before INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs(not_before, priority);
CREATE INDEX IF NOT EXISTS idx_jobs_dataset ON jobs(dataset);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
