//! Storage traits and error types
//!
//! This module defines the contracts the engine needs from its external
//! stores: a key-value tag store, an atomic counter store for rate limits
//! and a content-addressed archive.

use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Content not found: {0}")]
    Missing(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Key-value store used for HTTP cache metadata, sessions and dedup markers
///
/// Keys are opaque, slash separated strings. Implementations must be safe
/// to share between worker tasks.
pub trait TagStore: Send + Sync {
    /// Gets the value stored under a key
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Stores a value, replacing any previous value
    fn put(&self, key: &str, value: &Value) -> StorageResult<()>;

    /// Checks whether a key has been written
    fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Deletes every key starting with `prefix`
    ///
    /// # Returns
    ///
    /// The number of deleted keys
    fn delete(&self, prefix: &str) -> StorageResult<usize>;

    /// Stores a value only if the key is not yet present
    ///
    /// This is the atomic alternative to `exists` followed by `put`.
    ///
    /// # Returns
    ///
    /// * `true` - The value was written
    /// * `false` - The key already existed and nothing changed
    fn put_if_absent(&self, key: &str, value: &Value) -> StorageResult<bool>;
}

/// Shared counters with a time to live, used for rate limiting
pub trait CounterStore: Send + Sync {
    /// Atomically increments a counter and returns the new value
    ///
    /// A counter that does not exist, or whose TTL has passed, restarts at 1
    /// with a fresh TTL.
    fn incr(&self, key: &str, ttl: Duration) -> StorageResult<u64>;

    /// Returns the current value of a live counter, 0 if absent or expired
    fn count(&self, key: &str) -> StorageResult<u64>;
}

/// Content-addressed blob storage
///
/// Blobs are identified by the hex SHA-256 digest of their content.
pub trait Archive: Send + Sync {
    /// Stores bytes and returns their checksum
    ///
    /// When `checksum` is given and already present, nothing is written.
    fn store(&self, data: &[u8], checksum: Option<&str>) -> StorageResult<String>;

    /// Stores the content of a file and returns its checksum
    fn store_file(&self, path: &Path, checksum: Option<&str>) -> StorageResult<String>;

    /// Checks whether a blob is present
    fn exists(&self, checksum: &str) -> bool;

    /// Opens a blob for streaming reads
    fn open(&self, checksum: &str) -> StorageResult<Box<dyn Read + Send>>;

    /// Returns a filesystem path holding the blob
    fn local_path(&self, checksum: &str) -> StorageResult<PathBuf>;

    /// Removes a blob; backends may answer [`StorageError::Unsupported`]
    fn delete(&self, checksum: &str) -> StorageResult<()>;
}
