use crate::context::{Context, Services};
use crate::dispatch::Job;
use crate::pipeline::PipelineLoader;
use crate::{Data, Result, SumiError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Longest a worker sleeps before looking at the queue again
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the back-off between failed attempts of a job
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Pulls jobs from the queue and executes their stages
pub struct Worker {
    loader: Arc<PipelineLoader>,
    services: Services,

    /// Jobs currently executing per run id
    in_flight: Mutex<HashMap<String, usize>>,

    processed: AtomicUsize,
}

impl Worker {
    pub fn new(loader: Arc<PipelineLoader>, services: Services) -> Self {
        Self {
            loader,
            services,
            in_flight: Mutex::new(HashMap::new()),
            processed: AtomicUsize::new(0),
        }
    }

    /// Number of jobs taken off the queue so far
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    /// Executes a single job
    ///
    /// Reloads the pipeline (from the loader's cache), rebuilds the context
    /// from the job's run state and runs the stage.
    pub async fn handle(&self, job: Job) -> Result<()> {
        let pipeline = self.loader.load(&job.config_file)?;
        let state = job.state();
        let ctx = Context::from_state(pipeline, &job.stage, state, self.services.clone())?;
        ctx.execute(job.data).await
    }

    /// Takes one ready job off the queue and processes it
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - A job was processed (successfully or not)
    /// * `Ok(false)` - No job was ready
    pub async fn run_once(&self) -> Result<bool> {
        match self.services.queue.dequeue()? {
            Some(job) => {
                self.process(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Processes jobs one at a time until the queue is empty
    ///
    /// Delayed jobs are waited for.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let start = self.processed();
        loop {
            if self.run_once().await? {
                continue;
            }
            match self.services.queue.next_ready_at()? {
                Some(at) => tokio::time::sleep(wait_until(at)).await,
                None => break,
            }
        }
        Ok(self.processed() - start)
    }

    /// Runs up to `concurrency` jobs at a time
    ///
    /// # Arguments
    ///
    /// * `concurrency` - Maximum number of stages executing at once
    /// * `until_idle` - Return once the queue is empty and nothing runs;
    ///   otherwise poll forever
    pub async fn run(self: Arc<Self>, concurrency: usize, until_idle: bool) -> Result<usize> {
        let start = self.processed();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!("Worker started with concurrency {}", concurrency.max(1));

        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SumiError::Other(e.into()))?;

            if let Some(job) = self.services.queue.dequeue()? {
                let worker = self.clone();
                tasks.spawn(async move {
                    worker.process(job).await;
                    drop(permit);
                });
                continue;
            }
            drop(permit);

            let wait = match self.services.queue.next_ready_at()? {
                Some(at) => wait_until(at),
                None if until_idle && tasks.is_empty() => break,
                None => POLL_INTERVAL,
            };

            if tasks.is_empty() {
                tokio::time::sleep(wait).await;
            } else {
                tokio::select! {
                    joined = tasks.join_next() => {
                        if let Some(Err(e)) = joined {
                            tracing::error!("Worker task failed: {}", e);
                        }
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        tracing::info!("Worker idle after {} jobs", self.processed() - start);
        Ok(self.processed() - start)
    }

    async fn process(&self, job: Job) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.enter(&job.run_id);

        let retry = job.clone();
        if let Err(err) = self.handle(job).await {
            self.retry_or_fail(retry.clone(), err);
        }

        self.leave(&retry.run_id);
        if let Err(e) = self.maybe_aggregate(&retry).await {
            tracing::error!("Aggregator of {} failed: {}", retry.dataset, e);
        }
    }

    fn retry_or_fail(&self, mut job: Job, err: SumiError) {
        let retryable = !matches!(err, SumiError::Config(_));
        if !retryable || job.attempt >= self.services.settings.job_retries {
            tracing::error!(
                "Job {}:{} failed after {} attempts: {}",
                job.dataset,
                job.stage,
                job.attempt + 1,
                err
            );
            return;
        }

        let backoff = Duration::from_secs(2u64.saturating_pow(job.attempt)).min(MAX_BACKOFF);
        tracing::warn!(
            "Job {}:{} failed ({}), retrying in {:?}",
            job.dataset,
            job.stage,
            err,
            backoff
        );
        job.attempt += 1;
        let job = job.with_delay(backoff);
        if let Err(e) = self.services.dispatcher().defer(job) {
            tracing::error!("Failed to requeue job: {}", e);
        }
    }

    /// Runs the pipeline's aggregator once its run has drained
    async fn maybe_aggregate(&self, job: &Job) -> Result<()> {
        if self.in_flight.lock().get(&job.run_id).copied().unwrap_or(0) > 0 {
            return Ok(());
        }
        if self.services.queue.pending(Some(&job.dataset))? > 0 {
            return Ok(());
        }

        let pipeline = self.loader.load(&job.config_file)?;
        let Some(stage) = pipeline.aggregator() else {
            return Ok(());
        };

        let marker = format!("{}/aggregator/{}", job.dataset, job.run_id);
        let first = self
            .services
            .tags
            .put_if_absent(&marker, &serde_json::Value::String(Utc::now().to_rfc3339()))?;
        if !first {
            return Ok(());
        }

        tracing::info!("Run {} of {} drained, aggregating", job.run_id, job.dataset);
        let ctx = Context::new(pipeline.clone(), stage, job.state(), self.services.clone())?;
        ctx.execute(Data::new()).await
    }

    fn enter(&self, run_id: &str) {
        *self.in_flight.lock().entry(run_id.to_string()).or_insert(0) += 1;
    }

    fn leave(&self, run_id: &str) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(run_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(run_id);
            }
        }
    }
}

fn wait_until(at: chrono::DateTime<Utc>) -> Duration {
    (at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(POLL_INTERVAL)
}
