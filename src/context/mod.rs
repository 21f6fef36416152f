//! Per-invocation execution context
//!
//! A [`Context`] is built for every stage invocation. It owns a scratch
//! directory for the duration of the call, a tracing span bound to the
//! pipeline, stage and run, and handles to the shared stores. Operations
//! use it to read their parameters, talk HTTP, store content and
//! [`emit`](Context::emit) items to downstream stages.

mod incremental;
mod params;
mod services;
mod tags;

pub use incremental::{mark_incremental_complete, should_skip_incremental, SKIP_INCREMENTAL};
pub use params::expand_env;
pub use services::Services;
pub use tags::Tags;

use crate::dispatch::Job;
use crate::helpers::template::value_to_string;
use crate::http::{ContextHttp, RateLimit};
use crate::pipeline::{Pipeline, Stage};
use crate::url::{hash_data, normalize_url};
use crate::{ConfigError, Data, Result, SumiError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::Instrument;

/// Data field holding the emit dedup key until a storage stage completes
pub const EMIT_CACHE_KEY: &str = "_emit_cache_key";

/// Fields consulted, in order, for the emit dedup key before the URL
const EMIT_KEY_FIELDS: &[&str] = &["emit_cache_key", "foreign_id", "content_hash"];

/// The part of a context that crosses process boundaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Pipeline name
    pub dataset: String,
    pub run_id: String,
    pub incremental: bool,
    pub continue_on_error: bool,
}

impl RunState {
    /// State for a new run with a fresh run id
    pub fn new(dataset: &str, incremental: bool, continue_on_error: bool) -> Self {
        Self {
            dataset: dataset.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            incremental,
            continue_on_error,
        }
    }
}

/// An item to hand to another stage
///
/// ```
/// use std::time::Duration;
/// use sumi_pipeline::{Data, Emit};
///
/// let emit = Emit::new(Data::new())
///     .rule("fetch")
///     .delay(Duration::from_secs(5))
///     .optional();
/// ```
#[derive(Debug, Clone)]
pub struct Emit {
    rule: String,
    stage: Option<String>,
    data: Data,
    delay: Option<Duration>,
    optional: bool,
    priority: i32,
}

impl Emit {
    pub fn new(data: Data) -> Self {
        Self {
            rule: "pass".to_string(),
            stage: None,
            data,
            delay: None,
            optional: false,
            priority: 0,
        }
    }

    /// Handler label used to find the target stage; `pass` by default
    pub fn rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = rule.into();
        self
    }

    /// Explicit target stage, bypassing the handler table
    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Drop the item quietly if no target stage is configured
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Execution context of one stage invocation
pub struct Context {
    pub pipeline: Arc<Pipeline>,
    pub stage: Arc<Stage>,
    pub state: RunState,
    pub services: Services,
    pub tags: Tags,
    pub http: ContextHttp,
    work_dir: TempDir,
    span: tracing::Span,
}

impl Context {
    /// Builds a context and its scratch directory
    ///
    /// # Arguments
    ///
    /// * `pipeline` - The owning pipeline
    /// * `stage` - The stage about to run
    /// * `state` - Run id and flags
    /// * `services` - Shared stores and queue
    ///
    /// # Returns
    ///
    /// * `Ok(Context)` - Ready to execute
    /// * `Err(SumiError)` - The scratch directory or HTTP session could not
    ///   be set up
    pub fn new(
        pipeline: Arc<Pipeline>,
        stage: Arc<Stage>,
        state: RunState,
        services: Services,
    ) -> Result<Self> {
        let work_root = services.settings.work_path();
        std::fs::create_dir_all(&work_root)?;
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{}-", pipeline.name))
            .tempdir_in(&work_root)?;

        let tags = Tags::new(pipeline.name.clone(), services.tags.clone());
        let http = ContextHttp::new(&services, &pipeline, &stage, &state.run_id, work_dir.path())?;
        let span = tracing::info_span!(
            "stage",
            pipeline = %pipeline.name,
            stage = %stage.name,
            run_id = %state.run_id
        );

        Ok(Self {
            pipeline,
            stage,
            state,
            services,
            tags,
            http,
            work_dir,
            span,
        })
    }

    /// Rebuilds a context from a job's run state
    pub fn from_state(
        pipeline: Arc<Pipeline>,
        stage: &str,
        state: RunState,
        services: Services,
    ) -> Result<Self> {
        let stage_obj = pipeline.get(stage).ok_or_else(|| ConfigError::MissingStage {
            pipeline: pipeline.name.clone(),
            stage: stage.to_string(),
        })?;
        Self::new(pipeline, stage_obj, state, services)
    }

    pub fn dump_state(&self) -> RunState {
        RunState {
            dataset: self.pipeline.name.clone(),
            ..self.state.clone()
        }
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    /// Scratch directory, removed when [`execute`](Self::execute) returns
    pub fn work_path(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn params(&self) -> &Data {
        &self.stage.params
    }

    /// Gets a stage parameter with `$VAR`/`${VAR}` expanded
    pub fn get(&self, name: &str) -> Option<Value> {
        self.stage.params.get(name).map(expand_env)
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(value_to_string(&other)),
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_f64().map_or(default, |f| f != 0.0),
            Some(Value::String(s)) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            _ => default,
        }
    }

    /// Builds a key namespaced under the pipeline name
    pub fn make_key<S: AsRef<str>>(&self, parts: &[S], prefix: Option<&str>) -> Option<String> {
        self.tags.make_key(parts, prefix)
    }

    /// Emits an item on the `pass` rule
    pub fn emit(&self, data: Data) -> Result<()> {
        self.emit_with(Emit::new(data))
    }

    pub fn emit_rule(&self, rule: &str, data: Data) -> Result<()> {
        self.emit_with(Emit::new(data).rule(rule))
    }

    /// Queues the stage itself again with new data
    pub fn recurse(&self, data: Data, delay: Option<Duration>) -> Result<()> {
        let mut emit = Emit::new(data).stage(self.stage.name.clone());
        if let Some(delay) = delay {
            emit = emit.delay(delay);
        }
        self.emit_with(emit)
    }

    /// Hands an item to a downstream stage through the queue
    ///
    /// Resolving no target stage is not an error: the item is dropped and,
    /// unless the emit is optional, the fact is logged. In incremental mode
    /// items whose dedup key was already marked complete are dropped too.
    ///
    /// The item is moved into the job, so the caller's copy can never be
    /// changed by what happens downstream.
    ///
    /// # Errors
    ///
    /// Only failures of the tag store or the queue.
    pub fn emit_with(&self, emit: Emit) -> Result<()> {
        let target = emit
            .stage
            .clone()
            .or_else(|| self.stage.handler(&emit.rule).map(str::to_string));
        let Some(target) = target else {
            if !emit.optional {
                tracing::info!("No next stage for rule {}", emit.rule);
            }
            return Ok(());
        };
        let Some(target) = self.pipeline.get(&target) else {
            if !emit.optional {
                tracing::info!("No next stage: {} (rule {})", target, emit.rule);
            }
            return Ok(());
        };

        let mut data = emit.data;
        if self.state.incremental {
            if let Some(cache_key) = self.emit_cache_key(&data) {
                if self.check_tag(&cache_key)? {
                    tracing::info!("Skipping emit (incremental): {}", cache_key);
                    return Ok(());
                }
                data.insert(EMIT_CACHE_KEY.to_string(), Value::String(cache_key));
            }
        }

        if self.services.settings.debug {
            if let Some(rate) = self.get_f64("sampling_rate") {
                if rand::random::<f64>() > rate {
                    tracing::info!("Skipping emit due to sampling rate {}", rate);
                    return Ok(());
                }
            }
        }

        let delay = emit.delay.unwrap_or(self.pipeline.delay);
        let job = Job::new(&self.dump_state(), &target.name, &self.pipeline.source, data)
            .with_delay(delay)
            .with_priority(emit.priority);
        self.services.dispatcher().defer(job)
    }

    fn emit_cache_key(&self, data: &Data) -> Option<String> {
        let explicit = EMIT_KEY_FIELDS
            .iter()
            .filter_map(|field| data.get(*field))
            .map(value_to_string)
            .find(|value| !value.is_empty());
        if let Some(key) = explicit {
            return self.make_key(&[key], Some("emit"));
        }

        let url = data.get("url").and_then(Value::as_str)?;
        let normalized = normalize_url(url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.to_string());
        self.make_key(&[hash_data(normalized)], Some("emit"))
    }

    /// Records that the item's emit dedup key has been fully processed
    ///
    /// Storage stages call this after success so later incremental runs
    /// stop emitting the same item.
    pub fn mark_emit_complete(&self, data: &Data) -> Result<()> {
        if let Some(key) = data.get(EMIT_CACHE_KEY).and_then(Value::as_str) {
            self.set_tag(key, &Value::String(Utc::now().to_rfc3339()))?;
            tracing::debug!("Marked emit complete: {}", key);
        }
        Ok(())
    }

    /// Runs the stage's operation and removes the scratch directory
    ///
    /// On success a pending skip-ahead marker whose target is this stage is
    /// set. Errors are logged. With `continue_on_error` they are swallowed,
    /// otherwise returned to the worker.
    pub async fn execute(self, data: Data) -> Result<()> {
        let span = self.span.clone();
        let pending = data
            .get(SKIP_INCREMENTAL)
            .map(|marker| Data::from_iter([(SKIP_INCREMENTAL.to_string(), marker.clone())]));
        let result = async {
            tracing::info!("Executing stage {} ({})", self.stage.name, self.stage.method);
            let operation = self.stage.resolve()?;
            operation.execute(&self, data).await?;
            if let Some(pending) = &pending {
                mark_incremental_complete(&self, pending)?;
            }
            Ok::<(), SumiError>(())
        }
        .instrument(span.clone())
        .await;

        let result = match result {
            Ok(()) => Ok(()),
            Err(err) => {
                span.in_scope(|| self.emit_exception(&err));
                if self.state.continue_on_error {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        };

        let Context { work_dir, .. } = self;
        let path = work_dir.path().to_path_buf();
        if let Err(e) = work_dir.close() {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
        result
    }

    pub fn emit_warning(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    pub fn emit_exception(&self, err: &SumiError) {
        tracing::error!("{}", err);
    }

    pub fn set_tag(&self, key: &str, value: &Value) -> Result<()> {
        self.tags.set(key, value)
    }

    pub fn get_tag(&self, key: &str) -> Result<Option<Value>> {
        self.tags.get(key)
    }

    pub fn check_tag(&self, key: &str) -> Result<bool> {
        self.tags.check(key)
    }

    /// Runs something at most once per key and expiry interval
    ///
    /// # Returns
    ///
    /// * `false` - First call for these criteria (or the marker expired);
    ///   the caller should do the work
    /// * `true` - Already done; skip
    ///
    /// Always `false` outside incremental mode.
    pub fn skip_incremental<S: AsRef<str>>(&self, criteria: &[S]) -> Result<bool> {
        if !self.state.incremental {
            return Ok(false);
        }
        let Some(key) = self.make_key(criteria, Some("inc")) else {
            return Ok(false);
        };

        let now = Utc::now();
        let marker = Value::String(now.to_rfc3339());
        if self.tags.set_if_absent(&key, &marker)? {
            return Ok(false);
        }

        if let Some(expire) = self.pipeline.expire_after() {
            let stale = self
                .tags
                .get(&key)?
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map_or(false, |at| now - at.with_timezone(&Utc) > expire);
            if stale {
                self.tags.set(&key, &marker)?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Stores bytes in the archive and returns their content hash
    pub fn store_data(&self, data: &[u8]) -> Result<String> {
        Ok(self.services.archive.store(data, None)?)
    }

    pub fn store_file(&self, path: &Path) -> Result<String> {
        Ok(self.services.archive.store_file(path, None)?)
    }

    pub fn open(&self, content_hash: &str) -> Result<Box<dyn Read + Send>> {
        Ok(self.services.archive.open(content_hash)?)
    }

    pub fn local_path(&self, content_hash: &str) -> Result<PathBuf> {
        Ok(self.services.archive.local_path(content_hash)?)
    }

    /// Counts a use of the limited resource, waiting while over the limit
    pub async fn enforce_rate_limit(&self, limit: &RateLimit) -> Result<()> {
        limit.enforce().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{load_pipeline_file, Settings};
    use crate::pipeline::OperationRegistry;

    /// A pipeline loaded from inline TOML, with in-memory services
    pub struct Fixture {
        pub dir: TempDir,
        pub pipeline: Arc<Pipeline>,
        pub services: Services,
    }

    impl Fixture {
        pub fn new(toml: &str) -> Self {
            Self::with_registry(toml, OperationRegistry::with_builtins())
        }

        pub fn with_registry(toml: &str, registry: OperationRegistry) -> Self {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("pipeline.toml");
            std::fs::write(&path, toml).unwrap();
            let file = load_pipeline_file(&path, false).unwrap();
            let pipeline = Arc::new(Pipeline::from_file(file, &path, Arc::new(registry)).unwrap());
            let settings = Settings {
                base_path: dir.path().join("data"),
                ..Settings::default()
            };
            let services = Services::in_memory(Arc::new(settings)).unwrap();
            Self {
                dir,
                pipeline,
                services,
            }
        }

        pub fn context(&self, stage: &str, incremental: bool) -> Context {
            let state = RunState::new(&self.pipeline.name, incremental, false);
            Context::from_state(self.pipeline.clone(), stage, state, self.services.clone()).unwrap()
        }

        /// Drains the queue without running anything
        pub fn queued(&self) -> Vec<Job> {
            std::iter::from_fn(|| self.services.queue.dequeue().unwrap()).collect()
        }
    }

    pub fn data(value: Value) -> Data {
        match value {
            Value::Object(map) => map,
            _ => panic!("test data must be an object"),
        }
    }
}
