//! Storage module for engine state
//!
//! This module holds the store contracts and their backends:
//! - [`TagStore`]: key-value tags for HTTP cache metadata, sessions and
//!   incremental markers
//! - [`CounterStore`]: expiring counters shared by rate limiters
//! - [`Archive`]: content-addressed blobs for fetched bodies
//!
//! SQLite backs tags and counters when several processes cooperate; the
//! in-memory store serves tests and single-process runs.

mod archive;
mod memory;
mod schema;
mod sqlite;
mod traits;

pub use archive::FileArchive;
pub use memory::MemoryStore;
pub use schema::initialize_schema;
pub use sqlite::SqliteStore;
pub use traits::{Archive, CounterStore, StorageError, StorageResult, TagStore};

pub(crate) use sqlite::open_connection;
