use crate::config::Settings;
use crate::dispatch::{Dispatcher, JobQueue, MemoryQueue, SqliteQueue};
use crate::http::ClientCache;
use crate::storage::{Archive, CounterStore, FileArchive, MemoryStore, SqliteStore, TagStore};
use crate::Result;
use std::sync::Arc;

/// The shared collaborators every context works with
///
/// Built once per process and cloned cheaply into each context.
#[derive(Clone)]
pub struct Services {
    pub settings: Arc<Settings>,
    pub tags: Arc<dyn TagStore>,
    pub counters: Arc<dyn CounterStore>,
    pub archive: Arc<dyn Archive>,
    pub queue: Arc<dyn JobQueue>,

    /// HTTP clients, one per proxy
    pub clients: ClientCache,
}

impl Services {
    /// Opens the SQLite database and file archive under the settings' paths
    ///
    /// Tags, counters and the job queue share one database file so that
    /// workers in several processes cooperate.
    pub fn open(settings: Arc<Settings>) -> Result<Self> {
        std::fs::create_dir_all(&settings.base_path)?;
        let database = settings.database_path();
        if let Some(parent) = database.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Arc::new(SqliteStore::new(&database)?);
        let queue = Arc::new(SqliteQueue::new(&database)?);
        let archive = Arc::new(FileArchive::new(settings.archive_path())?);
        tracing::info!("Using database {}", database.display());

        Ok(Self {
            settings,
            tags: store.clone(),
            counters: store,
            archive,
            queue,
            clients: ClientCache::default(),
        })
    }

    /// Services with in-memory tags, counters and queue
    ///
    /// The archive still lives on disk under the settings' base path.
    pub fn in_memory(settings: Arc<Settings>) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let archive = Arc::new(FileArchive::new(settings.archive_path())?);
        Ok(Self {
            settings,
            tags: store.clone(),
            counters: store,
            archive,
            queue: Arc::new(MemoryQueue::new()),
            clients: ClientCache::default(),
        })
    }

    /// Replaces the archive backend
    pub fn with_archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.queue.clone())
    }
}
