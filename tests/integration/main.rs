//! Integration tests for the pipeline engine
//!
//! These tests serve small sites with wiremock and run whole pipelines
//! through the worker, the way `sumi-pipeline run --wait` does.

mod crawl;
mod http_cache;
mod worker;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use sumi_pipeline::{
    Context, Data, Operation, OperationRegistry, Pipeline, PipelineLoader, Services, Settings,
    Worker,
};
use tempfile::TempDir;

/// A pipeline file on disk with in-memory services around it
pub struct Harness {
    pub dir: TempDir,
    pub path: PathBuf,
    pub loader: Arc<PipelineLoader>,
    pub services: Services,
}

impl Harness {
    pub fn new(toml: &str, registry: OperationRegistry) -> Self {
        Self::with_settings(toml, registry, |_| {})
    }

    pub fn with_settings<F>(toml: &str, registry: OperationRegistry, configure: F) -> Self
    where
        F: FnOnce(&mut Settings),
    {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, toml).expect("Failed to write pipeline");

        let mut settings = Settings {
            base_path: dir.path().join("data"),
            ..Settings::default()
        };
        configure(&mut settings);

        let loader = Arc::new(PipelineLoader::new(Arc::new(registry), &settings));
        let services = Services::in_memory(Arc::new(settings)).expect("Failed to open services");
        Self {
            dir,
            path,
            loader,
            services,
        }
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.loader.load(&self.path).expect("Failed to load pipeline")
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.loader.clone(), self.services.clone())
    }

    /// Starts a run and works the queue until it is empty
    pub async fn run(&self, incremental: bool) -> usize {
        self.pipeline()
            .run(&self.services, Some(incremental), None)
            .expect("Failed to start run");
        self.worker()
            .run_until_idle()
            .await
            .expect("Worker failed")
    }

    /// Output directory of the `directory` store for this pipeline
    pub fn store_dir(&self) -> PathBuf {
        self.services
            .settings
            .store_path()
            .join(&self.pipeline().name)
    }
}

/// Records every item it receives
#[derive(Clone, Default)]
pub struct Collect {
    pub items: Arc<Mutex<Vec<Data>>>,
}

impl Collect {
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn take(&self) -> Vec<Data> {
        std::mem::take(&mut *self.items.lock())
    }
}

#[async_trait]
impl Operation for Collect {
    async fn execute(&self, _ctx: &Context, data: Data) -> sumi_pipeline::Result<()> {
        self.items.lock().push(data);
        Ok(())
    }
}

/// Built-in operations plus `collect`, recording into the given collector
pub fn registry_with(collect: &Collect) -> OperationRegistry {
    let mut registry = OperationRegistry::with_builtins();
    registry.register("collect", collect.clone());
    registry
}
