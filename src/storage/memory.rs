//! In-memory storage for tests and single-process runs

use crate::storage::traits::{CounterStore, StorageResult, TagStore};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Process-local [`TagStore`] and [`CounterStore`]
#[derive(Default)]
pub struct MemoryStore {
    tags: Mutex<HashMap<String, Value>>,
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tags
    pub fn len(&self) -> usize {
        self.tags.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.lock().is_empty()
    }
}

impl TagStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.tags.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> StorageResult<()> {
        self.tags.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.tags.lock().contains_key(key))
    }

    fn delete(&self, prefix: &str) -> StorageResult<usize> {
        let mut tags = self.tags.lock();
        let before = tags.len();
        tags.retain(|key, _| !key.starts_with(prefix));
        Ok(before - tags.len())
    }

    fn put_if_absent(&self, key: &str, value: &Value) -> StorageResult<bool> {
        let mut tags = self.tags.lock();
        if tags.contains_key(key) {
            return Ok(false);
        }
        tags.insert(key.to_string(), value.clone());
        Ok(true)
    }
}

impl CounterStore for MemoryStore {
    fn incr(&self, key: &str, ttl: Duration) -> StorageResult<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        counters.retain(|_, (_, expires_at)| *expires_at >= now);

        let entry = counters.entry(key.to_string()).or_insert((0, now + ttl));
        entry.0 += 1;
        Ok(entry.0)
    }

    fn count(&self, key: &str) -> StorageResult<u64> {
        let now = Instant::now();
        Ok(self
            .counters
            .lock()
            .get(key)
            .filter(|(_, expires_at)| *expires_at >= now)
            .map(|(value, _)| *value)
            .unwrap_or(0))
    }
}
