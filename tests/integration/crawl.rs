//! End-to-end crawls: seed, fetch, parse and store

use crate::{registry_with, Collect, Harness};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PIPELINE: &str = r#"
name = "reports"
description = "Annual reports"

[pipeline.init]
method = "seed"
params = { url = "BASE/index.html" }
handle = { pass = "fetch" }

[pipeline.fetch]
method = "fetch"
handle = { pass = "parse" }

[pipeline.parse]
method = "parse"
params = { store = { mime_group = "documents" } }
handle = { fetch = "fetch", store = "store" }

[pipeline.store]
method = "directory"
handle = { pass = "done" }

[pipeline.done]
method = "collect"
"#;

const INDEX: &str = r#"<html><head><title>Reports</title></head><body>
    <a href="/docs/report.pdf" title="Annual report">2020</a>
    <a href="docs/notes.pdf">Notes</a>
    <a href="/about.html">About</a>
    <a href="mailto:press@example.com">Press</a>
</body></html>"#;

async fn serve_site() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/index.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string(INDEX),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/about.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html><body><p>About us</p></body></html>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/report.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(b"%PDF-1.4 annual report".to_vec()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/notes.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(b"%PDF-1.4 notes".to_vec()),
        )
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn test_full_crawl_stores_documents() {
    let server = serve_site().await;
    let collect = Collect::default();
    let harness = Harness::new(&PIPELINE.replace("BASE", &server.uri()), registry_with(&collect));

    let processed = harness.run(true).await;
    // init, 4 fetches, 4 parses, 2 stores, 2 collects
    assert_eq!(processed, 13);

    let stored = collect.take();
    assert_eq!(stored.len(), 2);

    let report = stored
        .iter()
        .find(|item| item["_file_name"] == json!("docs/report.pdf"))
        .expect("report was not stored");
    assert!(report["url"].as_str().unwrap().ends_with("/docs/report.pdf"));
    assert_eq!(report["status_code"], json!(200));

    let store_dir = harness.store_dir();
    let content = std::fs::read(store_dir.join("docs/report.pdf")).unwrap();
    assert_eq!(content, b"%PDF-1.4 annual report");
    assert!(store_dir.join("docs/notes.pdf").exists());

    let hash = report["content_hash"].as_str().unwrap();
    let sidecar = std::fs::read_to_string(store_dir.join(format!("docs/{}.json", hash))).unwrap();
    let sidecar: serde_json::Value = serde_json::from_str(&sidecar).unwrap();
    assert_eq!(sidecar["_file_name"], json!("docs/report.pdf"));
}

#[tokio::test]
async fn test_incremental_rerun_stores_nothing_new() {
    let server = serve_site().await;
    let collect = Collect::default();
    let harness = Harness::new(&PIPELINE.replace("BASE", &server.uri()), registry_with(&collect));

    harness.run(true).await;
    assert_eq!(collect.take().len(), 2);

    harness.run(true).await;
    assert_eq!(collect.len(), 0);

    // without incremental mode everything is stored again
    harness.run(false).await;
    assert_eq!(collect.len(), 2);
}

#[tokio::test]
async fn test_incremental_rerun_stops_after_fetch() {
    let server = serve_site().await;
    let collect = Collect::default();
    let pipeline = PIPELINE
        .replace("BASE", &server.uri())
        .replace("params = { store = { mime_group = \"documents\" } }\n", "");
    let harness = Harness::new(&pipeline, registry_with(&collect));

    harness.run(true).await;
    // every page is stored, the index included
    assert_eq!(collect.take().len(), 4);

    // init and the index fetch; the fetched index was stored before
    assert_eq!(harness.run(true).await, 2);
    assert_eq!(collect.len(), 0);
}

#[tokio::test]
async fn test_session_cookies_carry_across_stages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc123; Path=/")
                .set_body_string("welcome"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .and(header("cookie", "sid=abc123"))
        .and(header("x-client", "sumi"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = r#"
name = "members"

[pipeline.init]
method = "session"
params = { user_agent = "sumi-test" }
handle = { pass = "login" }

[pipeline.login]
method = "fetch"
params = { url = "BASE/login", headers = { x-client = "sumi" } }
handle = { pass = "private" }

[pipeline.private]
method = "fetch"
params = { url = "BASE/private" }
handle = { pass = "done" }

[pipeline.done]
method = "collect"
"#;
    let collect = Collect::default();
    let harness = Harness::new(&pipeline.replace("BASE", &server.uri()), registry_with(&collect));
    harness.run(false).await;

    let items = collect.take();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status_code"], json!(200));
    assert!(items[0]["url"].as_str().unwrap().ends_with("/private"));
}

#[tokio::test]
async fn test_failed_fetch_ends_the_branch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = r#"
name = "gone"

[pipeline.init]
method = "seed"
params = { urls = ["BASE/gone"] }
handle = { pass = "fetch" }

[pipeline.fetch]
method = "fetch"
handle = { pass = "done" }

[pipeline.done]
method = "collect"
"#;
    let collect = Collect::default();
    let harness = Harness::new(&pipeline.replace("BASE", &server.uri()), registry_with(&collect));
    let processed = harness.run(false).await;

    assert_eq!(processed, 2);
    assert_eq!(collect.len(), 0);
}
