//! Job dispatch
//!
//! Every stage invocation travels through a [`JobQueue`] as a [`Job`]. The
//! [`Dispatcher`] is the single enqueue point used by contexts and by
//! [`Pipeline::run`](crate::Pipeline::run); [`Worker`]s pull jobs, rebuild
//! a context from the job's run state and execute the stage.
//!
//! Delivery is at least once. A job may run twice if a worker fails after
//! executing it; the incremental tags make such repeats cheap rather than
//! impossible.

mod memory;
mod sqlite;
mod worker;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;
pub use worker::Worker;

use crate::context::RunState;
use crate::{Data, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A queued stage invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,

    /// Pipeline name
    pub dataset: String,

    /// Target stage
    pub stage: String,

    /// Pipeline file the worker reloads the graph from
    pub config_file: PathBuf,

    pub run_id: String,

    pub data: Data,

    pub incremental: bool,

    pub continue_on_error: bool,

    /// Higher runs first
    #[serde(default)]
    pub priority: i32,

    /// Failed executions so far
    #[serde(default)]
    pub attempt: u32,

    /// Earliest time the job may run
    pub not_before: DateTime<Utc>,
}

impl Job {
    pub fn new(state: &RunState, stage: &str, config_file: &Path, data: Data) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dataset: state.dataset.clone(),
            stage: stage.to_string(),
            config_file: config_file.to_path_buf(),
            run_id: state.run_id.clone(),
            data,
            incremental: state.incremental,
            continue_on_error: state.continue_on_error,
            priority: 0,
            attempt: 0,
            not_before: Utc::now(),
        }
    }

    /// Postpones the job by `delay` from now
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if let Ok(delay) = chrono::Duration::from_std(delay) {
            self.not_before = Utc::now() + delay;
        }
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// The run state carried by this job
    pub fn state(&self) -> RunState {
        RunState {
            dataset: self.dataset.clone(),
            run_id: self.run_id.clone(),
            incremental: self.incremental,
            continue_on_error: self.continue_on_error,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }
}

/// Queue of pending jobs
///
/// Implementations hand out the highest-priority ready job first, oldest
/// first among equal priorities. A dequeued job is removed from the queue.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<()>;

    /// Takes the next job whose `not_before` has passed
    fn dequeue(&self) -> Result<Option<Job>>;

    /// Removes all queued jobs of a dataset
    fn cancel(&self, dataset: &str) -> Result<usize>;

    /// Counts queued jobs, optionally only those of one dataset
    fn pending(&self, dataset: Option<&str>) -> Result<usize>;

    /// Earliest `not_before` among queued jobs
    fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Hands jobs to the queue
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub fn defer(&self, job: Job) -> Result<()> {
        tracing::debug!(
            "Queueing {}:{} for run {} (attempt {})",
            job.dataset,
            job.stage,
            job.run_id,
            job.attempt
        );
        self.queue.enqueue(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_from_state() {
        let state = RunState::new("gazette", true, false);
        let job = Job::new(&state, "fetch", Path::new("/p/gazette.toml"), Data::new())
            .with_priority(5);

        assert_eq!(job.dataset, "gazette");
        assert_eq!(job.run_id, state.run_id);
        assert_eq!(job.priority, 5);
        assert_eq!(job.state(), state);
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn test_delayed_job_not_ready() {
        let state = RunState::new("gazette", true, false);
        let job = Job::new(&state, "fetch", Path::new("p.toml"), Data::new())
            .with_delay(Duration::from_secs(60));
        assert!(!job.is_ready(Utc::now()));
        assert!(job.is_ready(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_job_serializes_to_json() {
        let state = RunState::new("gazette", false, true);
        let mut data = Data::new();
        data.insert("url".into(), "https://example.com".into());
        let job = Job::new(&state, "fetch", Path::new("p.toml"), data);

        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }
}
