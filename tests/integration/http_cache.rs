//! Conditional requests and response metadata passed between stages

use crate::{registry_with, Collect, Harness};
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use sumi_pipeline::context::RunState;
use sumi_pipeline::storage::{Archive, FileArchive, StorageResult};
use sumi_pipeline::Context;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// File archive counting the writes it receives
struct CountingArchive {
    inner: FileArchive,
    writes: AtomicUsize,
}

impl Archive for CountingArchive {
    fn store(&self, data: &[u8], checksum: Option<&str>) -> StorageResult<String> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.store(data, checksum)
    }

    fn store_file(&self, path: &Path, checksum: Option<&str>) -> StorageResult<String> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.store_file(path, checksum)
    }

    fn exists(&self, checksum: &str) -> bool {
        self.inner.exists(checksum)
    }

    fn open(&self, checksum: &str) -> StorageResult<Box<dyn Read + Send>> {
        self.inner.open(checksum)
    }

    fn local_path(&self, checksum: &str) -> StorageResult<PathBuf> {
        self.inner.local_path(checksum)
    }

    fn delete(&self, checksum: &str) -> StorageResult<()> {
        self.inner.delete(checksum)
    }
}

const PIPELINE: &str = r#"
name = "tables"

[pipeline.init]
method = "seed"
params = { url = "BASE/data.csv" }
handle = { pass = "fetch" }

[pipeline.fetch]
method = "fetch"
handle = { pass = "store" }

[pipeline.store]
method = "directory"
handle = { pass = "done" }

[pipeline.done]
method = "collect"
"#;

const BODY: &str = "id,name\n1,alpha\n2,beta\n";

#[tokio::test]
async fn test_not_modified_reuses_archived_content() {
    let server = MockServer::start().await;
    // mounted first so that it wins for conditional requests
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/csv")
                .insert_header("etag", "\"v1\"")
                .set_body_string(BODY),
        )
        .expect(1)
        .mount(&server)
        .await;

    let collect = Collect::default();
    let mut harness =
        Harness::new(&PIPELINE.replace("BASE", &server.uri()), registry_with(&collect));
    let archive = Arc::new(CountingArchive {
        inner: FileArchive::new(harness.dir.path().join("archive")).unwrap(),
        writes: AtomicUsize::new(0),
    });
    harness.services = harness.services.clone().with_archive(archive.clone());

    harness.run(false).await;
    let first = collect.take();
    assert_eq!(first.len(), 1);
    assert_eq!(archive.writes.load(Ordering::SeqCst), 1);

    harness.run(false).await;
    let second = collect.take();
    assert_eq!(second.len(), 1);
    assert_eq!(archive.writes.load(Ordering::SeqCst), 1);

    assert_eq!(second[0]["content_hash"], first[0]["content_hash"]);
    assert_eq!(second[0]["status_code"], json!(200));
    assert_eq!(second[0]["_file_name"], json!("data.csv"));

    let stored = std::fs::read_to_string(harness.store_dir().join("data.csv")).unwrap();
    assert_eq!(stored, BODY);
}

#[tokio::test]
async fn test_cache_disabled_skips_conditional_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .and(header_exists("if-none-match"))
        .respond_with(ResponseTemplate::new(304))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/csv")
                .insert_header("etag", "\"v1\"")
                .set_body_string(BODY),
        )
        .expect(2)
        .mount(&server)
        .await;

    let collect = Collect::default();
    let harness = Harness::with_settings(
        &PIPELINE.replace("BASE", &server.uri()),
        registry_with(&collect),
        |settings| settings.http_cache = false,
    );
    harness.run(false).await;
    harness.run(false).await;
    assert_eq!(collect.len(), 2);
}

#[tokio::test]
async fn test_changed_content_gets_suffixed_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/csv")
                .set_body_string(BODY),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/csv")
                .set_body_string("id,name\n3,gamma\n"),
        )
        .mount(&server)
        .await;

    let collect = Collect::default();
    let harness = Harness::new(&PIPELINE.replace("BASE", &server.uri()), registry_with(&collect));
    harness.run(false).await;
    harness.run(false).await;

    let items = collect.take();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["_file_name"], json!("data.csv"));

    let hash = items[1]["content_hash"].as_str().unwrap();
    let expected = format!("data_{}.csv", &hash[..8]);
    assert_eq!(items[1]["_file_name"], json!(expected));
    assert!(harness.store_dir().join(&expected).exists());
}

#[tokio::test]
async fn test_serialized_response_rehashes_in_another_context() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/csv; charset=utf-8")
                .set_body_string(BODY),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(
        &PIPELINE.replace("BASE", &server.uri()),
        registry_with(&Collect::default()),
    );
    let pipeline = harness.pipeline();
    let url = format!("{}/data.csv", server.uri());

    let ctx = Context::from_state(
        pipeline.clone(),
        "fetch",
        RunState::new("tables", false, false),
        harness.services.clone(),
    )
    .unwrap();
    let mut response = ctx.http.get(&url).await.unwrap();
    let data = response.serialize().await.unwrap();

    // a context of a later stage, as a worker would rebuild it from a job
    let later = Context::from_state(
        pipeline,
        "store",
        RunState::new("tables", false, false),
        harness.services.clone(),
    )
    .unwrap();
    let mut rehashed = later.http.rehash(&data).unwrap();

    assert_eq!(rehashed.url(), response.url());
    assert_eq!(rehashed.status_code(), Some(200));
    assert_eq!(rehashed.content_hash(), response.content_hash());
    assert_eq!(rehashed.encoding().as_deref(), Some("utf-8"));
    assert_eq!(rehashed.text().unwrap(), Some(BODY));
}
