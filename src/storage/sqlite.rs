//! SQLite storage implementation
//!
//! This module provides a SQLite-backed [`TagStore`] and [`CounterStore`].
//! Several processes may open the same database file; SQLite serializes the
//! writes and the WAL journal keeps readers from blocking.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{CounterStore, StorageResult, TagStore};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Opens a database file with the pragmas and schema every backend expects
pub(crate) fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
    ",
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;

    initialize_schema(&conn)?;
    Ok(conn)
}

/// SQLite storage backend for tags and counters
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Successfully opened/created database
    /// * `Err(rusqlite::Error)` - Failed to open database
    pub fn new(path: &Path) -> rusqlite::Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
        })
    }

    /// Creates an in-memory database, private to this store
    pub fn new_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl TagStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM tags WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &Value) -> StorageResult<()> {
        let raw = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();
        self.conn.lock().execute(
            "INSERT INTO tags (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, raw, now],
        )?;
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .lock()
            .query_row("SELECT 1 FROM tags WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn delete(&self, prefix: &str) -> StorageResult<usize> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM tags WHERE substr(key, 1, length(?1)) = ?1",
            [prefix],
        )?;
        Ok(deleted)
    }

    fn put_if_absent(&self, key: &str, value: &Value) -> StorageResult<bool> {
        let raw = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO tags (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, raw, now],
        )?;
        Ok(inserted == 1)
    }
}

impl CounterStore for SqliteStore {
    fn incr(&self, key: &str, ttl: Duration) -> StorageResult<u64> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;
        let conn = self.conn.lock();

        conn.execute("DELETE FROM counters WHERE expires_at < ?1", [now])?;
        let value: i64 = conn.query_row(
            "INSERT INTO counters (key, value, expires_at) VALUES (?1, 1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = value + 1
             RETURNING value",
            params![key, expires_at],
            |row| row.get(0),
        )?;
        Ok(value.max(0) as u64)
    }

    fn count(&self, key: &str) -> StorageResult<u64> {
        let now = Utc::now().timestamp_millis();
        let value: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM counters WHERE key = ?1 AND expires_at >= ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }
}
