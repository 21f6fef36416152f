//! Pipeline graph module
//!
//! A [`Pipeline`] is an ordered set of named [`Stage`]s loaded from a TOML
//! file. Each stage wraps one [`Operation`] together with its parameters and
//! a handler table routing rule labels (`pass`, `fetch`, `store`, ...) to
//! downstream stages.

mod loader;
mod registry;

pub use loader::{PipelineLoader, PipelineManager};
pub use registry::{Operation, OperationRegistry};

use crate::config::{compute_config_hash, PipelineFile};
use crate::context::{RunState, Services};
use crate::dispatch::Job;
use crate::{ConfigError, ConfigResult, Data, Result};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Name given to the pseudo-stage running a pipeline's aggregator
pub const AGGREGATOR_STAGE: &str = "aggregator";

/// A node of the pipeline graph
pub struct Stage {
    pub name: String,
    pub method: String,
    pub params: Data,

    /// Rule label to downstream stage name
    pub handlers: IndexMap<String, String>,

    operation: OnceLock<Arc<dyn Operation>>,
    registry: Arc<OperationRegistry>,
    base_dir: PathBuf,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        method: impl Into<String>,
        params: Data,
        handlers: IndexMap<String, String>,
        registry: Arc<OperationRegistry>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            params,
            handlers,
            operation: OnceLock::new(),
            registry,
            base_dir: base_dir.into(),
        }
    }

    /// Resolves the stage's method to an operation, caching the result
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownOperation`] when nothing is registered under
    /// the method.
    pub fn resolve(&self) -> ConfigResult<Arc<dyn Operation>> {
        if let Some(op) = self.operation.get() {
            return Ok(op.clone());
        }
        let op = self
            .registry
            .resolve(&self.method, &self.base_dir)
            .ok_or_else(|| ConfigError::UnknownOperation {
                stage: self.name.clone(),
                method: self.method.clone(),
            })?;
        Ok(self.operation.get_or_init(|| op).clone())
    }

    /// Looks up the stage a rule label routes to
    pub fn handler(&self, rule: &str) -> Option<&str> {
        self.handlers.get(rule).map(String::as_str)
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// A loaded pipeline definition
///
/// Immutable once built; shared as `Arc<Pipeline>` between contexts.
#[derive(Debug)]
pub struct Pipeline {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub init_stage: String,

    /// Default delay before emitted jobs become runnable
    pub delay: Duration,

    /// Days until incremental markers are considered stale
    pub expire: u64,

    pub stealthy: bool,

    /// File the pipeline was loaded from
    pub source: PathBuf,

    pub config_hash: String,

    stages: IndexMap<String, Arc<Stage>>,
    aggregator: Option<Arc<Stage>>,
}

impl Pipeline {
    /// Builds a pipeline from a validated file
    ///
    /// # Arguments
    ///
    /// * `file` - The parsed pipeline file
    /// * `source` - Where the file was read from; jobs refer back to it
    /// * `registry` - Registry stage methods are resolved against
    ///
    /// # Returns
    ///
    /// * `Ok(Pipeline)` - Every stage resolved to an operation
    /// * `Err(SumiError)` - A stage method could not be resolved
    pub fn from_file(
        file: PipelineFile,
        source: &Path,
        registry: Arc<OperationRegistry>,
    ) -> Result<Self> {
        let base_dir = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let config_hash = compute_config_hash(source).unwrap_or_default();

        let mut stages = IndexMap::with_capacity(file.pipeline.len());
        for (name, config) in file.pipeline {
            let stage = Stage::new(
                name.clone(),
                config.method,
                config.params,
                config.handle,
                registry.clone(),
                base_dir.clone(),
            );
            stage.resolve()?;
            stages.insert(name, Arc::new(stage));
        }

        let aggregator = match file.aggregator {
            Some(config) => {
                let stage = Stage::new(
                    AGGREGATOR_STAGE,
                    config.method,
                    config.params,
                    IndexMap::new(),
                    registry.clone(),
                    base_dir.clone(),
                );
                stage.resolve()?;
                Some(Arc::new(stage))
            }
            None => None,
        };

        Ok(Self {
            name: file.name,
            description: file.description,
            category: file.category,
            init_stage: file.init,
            delay: Duration::from_secs(file.delay),
            expire: file.expire,
            stealthy: file.stealthy,
            source: source.to_path_buf(),
            config_hash,
            stages,
            aggregator,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stage>> {
        self.stages.get(name).cloned()
    }

    /// Stages in definition order
    pub fn stages(&self) -> impl Iterator<Item = &Arc<Stage>> {
        self.stages.values()
    }

    pub fn aggregator(&self) -> Option<Arc<Stage>> {
        self.aggregator.clone()
    }

    /// Incremental markers older than this are treated as absent
    pub fn expire_after(&self) -> Option<chrono::Duration> {
        (self.expire > 0).then(|| chrono::Duration::days(self.expire as i64))
    }

    fn init(&self) -> Result<Arc<Stage>> {
        self.get(&self.init_stage).ok_or_else(|| {
            ConfigError::MissingStage {
                pipeline: self.name.clone(),
                stage: self.init_stage.clone(),
            }
            .into()
        })
    }

    /// Starts a new run
    ///
    /// Pending jobs of earlier runs are cancelled, then the init stage is
    /// queued with an empty item.
    ///
    /// # Arguments
    ///
    /// * `services` - Shared stores and queue
    /// * `incremental` - Override for the configured incremental mode
    /// * `continue_on_error` - Override for the configured error policy
    ///
    /// # Returns
    ///
    /// The new run id
    pub fn run(
        &self,
        services: &Services,
        incremental: Option<bool>,
        continue_on_error: Option<bool>,
    ) -> Result<String> {
        let stage = self.init()?;
        self.cancel(services)?;

        let state = RunState::new(
            &self.name,
            incremental.unwrap_or(services.settings.incremental),
            continue_on_error.unwrap_or(services.settings.continue_on_error),
        );
        tracing::info!(
            "Starting run {} of {} (incremental: {}, config {})",
            state.run_id,
            self.name,
            state.incremental,
            short_hash(&self.config_hash)
        );

        let job = Job::new(&state, &stage.name, &self.source, Data::new());
        services.dispatcher().defer(job)?;
        Ok(state.run_id)
    }

    /// Removes every queued job of this pipeline
    ///
    /// Running stages are not interrupted.
    pub fn cancel(&self, services: &Services) -> Result<usize> {
        let removed = services.queue.cancel(&self.name)?;
        if removed > 0 {
            tracing::info!("Cancelled {} pending jobs of {}", removed, self.name);
        }
        Ok(removed)
    }

    /// Cancels the pipeline and deletes all of its tags
    pub fn flush(&self, services: &Services) -> Result<()> {
        self.cancel(services)?;
        let deleted = services.tags.delete(&format!("{}/", self.name))?;
        tracing::info!("Flushed {} tags of {}", deleted, self.name);
        Ok(())
    }

    pub fn pending(&self, services: &Services) -> Result<usize> {
        Ok(services.queue.pending(Some(&self.name))?)
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
