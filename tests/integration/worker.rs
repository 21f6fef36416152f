//! Worker behaviour: retries, error policy, concurrency and aggregation

use crate::{registry_with, Collect, Harness};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use sumi_pipeline::{ConfigError, Context, Data, Operation, OperationRegistry, SumiError};

/// Fails the first `failures` invocations, then passes items on
#[derive(Clone)]
struct Flaky {
    calls: Arc<AtomicUsize>,
    failures: usize,
    fatal: bool,
}

impl Flaky {
    fn new(failures: usize) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            failures,
            fatal: false,
        }
    }

    fn fatal() -> Self {
        Self {
            fatal: true,
            ..Self::new(usize::MAX)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operation for Flaky {
    async fn execute(&self, ctx: &Context, data: Data) -> sumi_pipeline::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            if self.fatal {
                return Err(ConfigError::Validation("broken stage".to_string()).into());
            }
            return Err(SumiError::Parse(format!("failure {}", call + 1)));
        }
        ctx.emit(data)
    }
}

const PIPELINE: &str = r#"
name = "flaky"

[pipeline.init]
method = "flaky"
handle = { pass = "done" }

[pipeline.done]
method = "collect"
"#;

fn registry(flaky: &Flaky, collect: &Collect) -> OperationRegistry {
    let mut registry = registry_with(collect);
    registry.register("flaky", flaky.clone());
    registry
}

#[tokio::test]
async fn test_failed_job_is_retried() {
    let flaky = Flaky::new(1);
    let collect = Collect::default();
    let harness = Harness::with_settings(PIPELINE, registry(&flaky, &collect), |settings| {
        settings.job_retries = 2
    });

    let processed = harness.run(false).await;

    assert_eq!(flaky.calls(), 2);
    assert_eq!(processed, 3);
    assert_eq!(collect.len(), 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let flaky = Flaky::new(usize::MAX);
    let collect = Collect::default();
    let harness = Harness::with_settings(PIPELINE, registry(&flaky, &collect), |settings| {
        settings.job_retries = 1
    });

    harness.run(false).await;

    assert_eq!(flaky.calls(), 2);
    assert_eq!(collect.len(), 0);
}

#[tokio::test]
async fn test_configuration_errors_are_not_retried() {
    let flaky = Flaky::fatal();
    let collect = Collect::default();
    let harness = Harness::new(PIPELINE, registry(&flaky, &collect));

    let processed = harness.run(false).await;

    assert_eq!(flaky.calls(), 1);
    assert_eq!(processed, 1);
}

#[tokio::test]
async fn test_continue_on_error_swallows_failures() {
    let flaky = Flaky::new(1);
    let collect = Collect::default();
    let harness = Harness::new(PIPELINE, registry(&flaky, &collect));

    harness
        .pipeline()
        .run(&harness.services, Some(false), Some(true))
        .unwrap();
    let processed = harness.worker().run_until_idle().await.unwrap();

    assert_eq!(flaky.calls(), 1);
    assert_eq!(processed, 1);
    assert_eq!(collect.len(), 0);
}

#[tokio::test]
async fn test_concurrent_worker_runs_aggregator_once() {
    let pipeline = r#"
name = "numbers"

[pipeline.init]
method = "sequence"
params = { start = 1, stop = 21 }
handle = { pass = "double" }

[pipeline.double]
method = "clean"
params = { values = { doubled = "{{ number }}{{ number }}" } }
handle = { pass = "done" }

[pipeline.done]
method = "collect"

[aggregator]
method = "summary"
"#;
    let collect = Collect::default();
    let summary = Collect::default();
    let mut registry = registry_with(&collect);
    registry.register("summary", summary.clone());
    let harness = Harness::new(pipeline, registry);

    harness
        .pipeline()
        .run(&harness.services, Some(false), None)
        .unwrap();
    let worker = Arc::new(harness.worker());
    let processed = worker.run(4, true).await.unwrap();

    // init, then 20 numbers through two stages
    assert_eq!(processed, 41);
    let items = collect.take();
    assert_eq!(items.len(), 20);
    assert!(items
        .iter()
        .any(|item| item["doubled"] == serde_json::json!("77")));
    assert_eq!(summary.len(), 1);
    assert_eq!(harness.pipeline().pending(&harness.services).unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_drops_pending_jobs() {
    let collect = Collect::default();
    let pipeline = r#"
name = "slow"
delay = 3600

[pipeline.init]
method = "seed"
params = { urls = ["https://example.com/a", "https://example.com/b"] }
handle = { pass = "done" }

[pipeline.done]
method = "collect"
"#;
    let harness = Harness::new(pipeline, registry_with(&collect));
    let pipeline = harness.pipeline();
    pipeline.run(&harness.services, Some(false), None).unwrap();

    assert!(harness.worker().run_once().await.unwrap());
    assert_eq!(pipeline.pending(&harness.services).unwrap(), 2);

    assert_eq!(pipeline.cancel(&harness.services).unwrap(), 2);
    assert_eq!(pipeline.pending(&harness.services).unwrap(), 0);
    assert_eq!(harness.worker().run_until_idle().await.unwrap(), 0);
    assert_eq!(collect.len(), 0);
}
