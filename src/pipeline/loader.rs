use crate::config::{load_pipeline_file, Settings};
use crate::pipeline::{OperationRegistry, Pipeline};
use crate::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loads pipelines and caches them per source path for the process lifetime
pub struct PipelineLoader {
    registry: Arc<OperationRegistry>,
    strict_handlers: bool,
    cache: Mutex<HashMap<PathBuf, Arc<Pipeline>>>,
}

impl PipelineLoader {
    pub fn new(registry: Arc<OperationRegistry>, settings: &Settings) -> Self {
        Self {
            registry,
            strict_handlers: settings.strict_handlers,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the pipeline defined at `path`, or returns the cached instance
    pub fn load(&self, path: &Path) -> Result<Arc<Pipeline>> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if let Some(pipeline) = self.cache.lock().get(&key) {
            return Ok(pipeline.clone());
        }

        let file = load_pipeline_file(path, self.strict_handlers)?;
        let pipeline = Arc::new(Pipeline::from_file(file, path, self.registry.clone())?);
        tracing::debug!("Loaded pipeline {} from {}", pipeline.name, path.display());

        // A concurrent load of the same path keeps whichever finished first
        Ok(self.cache.lock().entry(key).or_insert(pipeline).clone())
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }
}

/// The pipelines found in a configuration directory
#[derive(Default)]
pub struct PipelineManager {
    pipelines: BTreeMap<String, Arc<Pipeline>>,
}

impl PipelineManager {
    /// Loads every `*.toml` file in `dir`
    ///
    /// Files that fail to load are logged and skipped. When two files
    /// declare the same name the later one (by file name) wins.
    pub fn load_path(loader: &PipelineLoader, dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut pipelines = BTreeMap::new();
        for path in paths {
            match loader.load(&path) {
                Ok(pipeline) => {
                    if pipelines.contains_key(&pipeline.name) {
                        tracing::warn!(
                            "Pipeline {} redefined by {}",
                            pipeline.name,
                            path.display()
                        );
                    }
                    pipelines.insert(pipeline.name.clone(), pipeline);
                }
                Err(e) => {
                    tracing::error!("Skipping {}: {}", path.display(), e);
                }
            }
        }

        tracing::info!("Loaded {} pipelines from {}", pipelines.len(), dir.display());
        Ok(Self { pipelines })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).cloned()
    }

    /// Pipelines sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pipeline>> {
        self.pipelines.values()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
