//! Storage operations: writing archived content to a directory

use crate::context::Context;
use crate::helpers::template::render_template;
use crate::pipeline::Operation;
use crate::rules::normalize_mimetype;
use crate::storage::StorageError;
use crate::url::hash_data;
use crate::{Data, Result, SumiError};
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use std::path::{Path, PathBuf};
use url::Url;

/// File extensions for common MIME types
const EXTENSIONS: &[(&str, &str)] = &[
    ("application/pdf", "pdf"),
    ("application/json", "json"),
    ("application/xml", "xml"),
    ("application/zip", "zip"),
    ("application/msword", "doc"),
    ("application/rtf", "rtf"),
    ("application/vnd.ms-excel", "xls"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
    ),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xlsx",
    ),
    ("application/vnd.oasis.opendocument.text", "odt"),
    ("text/html", "html"),
    ("text/plain", "txt"),
    ("text/csv", "csv"),
    ("text/xml", "xml"),
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/tiff", "tiff"),
];

/// Writes the item's archived content below a directory
///
/// Files go to `<path>/<pipeline>/<relative path>`, where `path` defaults
/// to the `store` directory under the base path. The relative path comes
/// from `compute_path`:
///
/// ```toml
/// [pipeline.store.params.compute_path]
/// method = "url_path"   # or "template", "file_name"
/// params = { include_domain = true, strip_prefix = "/api/v1" }
/// ```
///
/// When a different file already occupies the path, the first eight
/// characters of the content hash are appended to the name. Item metadata
/// is written next to the file as `<content_hash>.json` and the item's emit
/// key is marked complete.
pub struct Directory;

#[async_trait]
impl Operation for Directory {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        store_directory(ctx, data).await
    }
}

/// Dispatches to a storage backend named by the `operation` param
///
/// `directory` is the only backend and the default.
pub struct Store;

#[async_trait]
impl Operation for Store {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        let operation = ctx.get_str("operation").unwrap_or_else(|| "directory".to_string());
        match operation.as_str() {
            "directory" => store_directory(ctx, data).await,
            other => {
                tracing::error!("Unknown store operation: {}", other);
                Ok(())
            }
        }
    }
}

async fn store_directory(ctx: &Context, mut data: Data) -> Result<()> {
    let response = ctx.http.rehash(&data)?;
    if !response.ok() {
        return Ok(());
    }
    let Some(content_hash) = data.get("content_hash").and_then(Value::as_str).map(str::to_string)
    else {
        ctx.emit_warning("No content hash in data.");
        return Ok(());
    };

    let base = directory_path(ctx);
    let mut relative = compute_file_path(ctx, &data, &content_hash, response.file_name())?;
    let mut file_path = base.join(&relative);
    let parent = file_path.parent().map(Path::to_path_buf).unwrap_or_else(|| base.clone());
    tokio::fs::create_dir_all(&parent).await?;

    if tokio::fs::try_exists(&file_path).await? {
        let existing = hash_data(tokio::fs::read(&file_path).await?);
        if existing != content_hash {
            let name = suffixed_name(&file_path, &content_hash);
            file_path = parent.join(&name);
            relative = relative.with_file_name(&name);
        }
    }

    let relative_name = relative.to_string_lossy().to_string();
    data.insert("_file_name".to_string(), Value::String(relative_name.clone()));
    if !tokio::fs::try_exists(&file_path).await? {
        tokio::fs::copy(response.local_path()?, &file_path).await?;
    }
    tracing::info!("Store [directory]: {}", relative_name);

    let meta_path = parent.join(format!("{}.json", content_hash));
    tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&data)?).await?;

    ctx.mark_emit_complete(&data)?;
    ctx.emit(data)
}

fn directory_path(ctx: &Context) -> PathBuf {
    let root = ctx
        .get_str("path")
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.services.settings.store_path());
    root.join(&ctx.pipeline.name)
}

fn suffixed_name(path: &Path, content_hash: &str) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let suffix = &content_hash[..content_hash.len().min(8)];
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}_{}", stem, suffix),
    }
}

/// Relative target path for an item's content
///
/// # Errors
///
/// [`SumiError::MetaData`] when no path can be computed: missing URL or
/// template, a URL without a file name, or an unknown method.
fn compute_file_path(
    ctx: &Context,
    data: &Data,
    content_hash: &str,
    response_file_name: Option<String>,
) -> Result<PathBuf> {
    let file_name = response_file_name
        .or_else(|| data.get("file_name").and_then(Value::as_str).map(str::to_string));
    let content_type = data
        .get("headers")
        .and_then(Value::as_object)
        .and_then(|headers| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .and_then(|(_, v)| v.as_str())
        });
    let mime_type = normalize_mimetype(content_type);

    let config = match ctx.get("compute_path") {
        Some(Value::Object(config)) => config,
        _ => Data::new(),
    };
    let method = config.get("method").and_then(Value::as_str).unwrap_or("url_path");
    let params = config
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let (dir, name) = match method {
        "template" => {
            let template = params
                .get("template")
                .and_then(Value::as_str)
                .ok_or_else(|| metadata("compute_path.params.template is required"))?;
            let mut context = data.clone();
            context.insert("content_hash".to_string(), Value::String(content_hash.to_string()));
            if let Some(file_name) = &file_name {
                context.insert("file_name".to_string(), Value::String(file_name.clone()));
            }
            split_path(&render_template(template, &context))
        }
        "url_path" => {
            let url = data
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| metadata("url_path requires `url` in data"))?;
            let parsed = Url::parse(url)?;
            let path = percent_decode_str(parsed.path()).decode_utf8_lossy();
            let mut path = path.trim_matches('/').to_string();
            if let Some(prefix) = params.get("strip_prefix").and_then(Value::as_str) {
                let prefix = prefix.trim_matches('/');
                if !prefix.is_empty() {
                    if let Some(rest) = path.strip_prefix(prefix) {
                        path = rest.trim_matches('/').to_string();
                    }
                }
            }
            let (mut dir, name) = split_path(&path);
            if params.get("include_domain").and_then(Value::as_bool).unwrap_or(false) {
                let mut host = parsed.host_str().unwrap_or_default().to_string();
                if let Some(port) = parsed.port() {
                    host = format!("{}:{}", host, port);
                }
                dir.insert(0, host);
            }
            if name.is_empty() {
                return Err(metadata(&format!("Could not extract file name from URL path: {}", url)));
            }
            (dir, name)
        }
        "file_name" => (Vec::new(), file_name.clone().unwrap_or_else(|| "data".to_string())),
        other => return Err(metadata(&format!("Unknown compute_path method: {}", other))),
    };
    if name.is_empty() {
        return Err(metadata("Computed path has no file name"));
    }

    let extension = file_extension(&name, &mime_type);
    let mut path: PathBuf = dir.iter().collect();
    path.push(safe_filename(&name, &extension));
    Ok(path)
}

fn metadata(message: &str) -> SumiError {
    SumiError::MetaData(message.to_string())
}

/// Splits a slash separated path into safe directory parts and a file name
///
/// Empty, `.` and `..` segments are dropped.
fn split_path(path: &str) -> (Vec<String>, String) {
    let mut parts: Vec<String> = path
        .split('/')
        .map(str::trim)
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .map(str::to_string)
        .collect();
    let name = parts.pop().unwrap_or_default();
    (parts, name)
}

fn file_extension(file_name: &str, mime_type: &str) -> String {
    if let Some(ext) = Path::new(file_name).extension().map(|e| e.to_string_lossy()) {
        if ext.len() > 1 {
            return ext.to_lowercase();
        }
    }
    EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == mime_type)
        .map(|(_, ext)| ext.to_string())
        .unwrap_or_else(|| "raw".to_string())
}

/// A file name made of lowercase ASCII letters, digits and underscores,
/// plus the extension
fn safe_filename(file_name: &str, extension: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut slug = String::with_capacity(stem.len());
    for c in stem.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "data" } else { slug };
    format!("{}.{}", slug, extension)
}

/// Removes the item's content from the archive
pub struct CleanupArchive;

#[async_trait]
impl Operation for CleanupArchive {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        let Some(content_hash) = data.get("content_hash").and_then(Value::as_str) else {
            ctx.emit_warning("No content hash in data.");
            return Ok(());
        };
        if !ctx.services.archive.exists(content_hash) {
            return Ok(());
        }
        match ctx.services.archive.delete(content_hash) {
            Ok(()) => {
                tracing::info!("Removed {} from archive", content_hash);
                Ok(())
            }
            Err(StorageError::Unsupported(_)) => {
                tracing::warn!("File deletion not supported by storage backend");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{data, Fixture};
    use crate::context::EMIT_CACHE_KEY;
    use serde_json::json;

    fn pipeline(params: &str) -> String {
        format!(
            r#"
name = "store_ops"

[pipeline.store]
method = "directory"
params = {}
handle = {{ pass = "done" }}

[pipeline.done]
method = "inspect"
"#,
            params
        )
    }

    fn item(ctx: &Context, body: &[u8], url: &str) -> Data {
        let hash = ctx.store_data(body).unwrap();
        data(json!({
            "url": url,
            "status_code": 200,
            "content_hash": hash,
            "headers": {"content-type": "application/pdf"},
        }))
    }

    #[test]
    fn test_safe_filename_and_extension() {
        assert_eq!(safe_filename("Annual Report (2020).PDF", "pdf"), "annual_report_2020.pdf");
        assert_eq!(safe_filename("???", "raw"), "data.raw");
        assert_eq!(file_extension("report", "application/pdf"), "pdf");
        assert_eq!(file_extension("report.DOCX", "application/pdf"), "docx");
        assert_eq!(file_extension("report", "application/x-unknown"), "raw");
    }

    #[test]
    fn test_split_path_drops_traversal() {
        let (dir, name) = split_path("../a/./b//c.pdf");
        assert_eq!(dir, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(name, "c.pdf");
    }

    #[tokio::test]
    async fn test_directory_writes_file_and_sidecar() {
        let fixture = Fixture::new(&pipeline("{}"));
        let ctx = fixture.context("store", false);
        let item = item(&ctx, b"%PDF-1.4", "https://example.com/docs/Report 1.pdf");
        let hash = item["content_hash"].as_str().unwrap().to_string();
        ctx.execute(item).await.unwrap();

        let dir = fixture.services.settings.store_path().join("store_ops/docs");
        assert_eq!(std::fs::read(dir.join("report_1.pdf")).unwrap(), b"%PDF-1.4");
        let sidecar: Value =
            serde_json::from_slice(&std::fs::read(dir.join(format!("{}.json", hash))).unwrap()).unwrap();
        assert_eq!(sidecar["_file_name"], json!("docs/report_1.pdf"));

        let jobs = fixture.queued();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].data["_file_name"], json!("docs/report_1.pdf"));
    }

    #[tokio::test]
    async fn test_directory_collision_gets_hash_suffix() {
        let fixture = Fixture::new(&pipeline("{}"));
        let url = "https://example.com/a.pdf";

        let first = fixture.context("store", false);
        let one = item(&first, b"one", url);
        first.execute(one).await.unwrap();

        let second = fixture.context("store", false);
        let two = item(&second, b"two", url);
        let hash = two["content_hash"].as_str().unwrap().to_string();
        second.execute(two).await.unwrap();

        let jobs = fixture.queued();
        let expected = format!("a_{}.pdf", &hash[..8]);
        assert_eq!(jobs[1].data["_file_name"], json!(expected));
        let dir = fixture.services.settings.store_path().join("store_ops");
        assert_eq!(std::fs::read(dir.join("a.pdf")).unwrap(), b"one");
        assert_eq!(std::fs::read(dir.join(expected)).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_directory_template_and_custom_path() {
        let out = tempfile::TempDir::new().unwrap();
        let params = format!(
            r#"{{ path = "{}", compute_path = {{ method = "template", params = {{ template = "{{{{ meta.kind }}}}/{{{{ meta.id }}}}" }} }} }}"#,
            out.path().display()
        );
        let fixture = Fixture::new(&pipeline(&params));
        let ctx = fixture.context("store", false);
        let mut item = item(&ctx, b"x", "https://example.com/x");
        item.insert("meta".to_string(), json!({"kind": "gazette", "id": 17}));
        ctx.execute(item).await.unwrap();

        assert!(out.path().join("store_ops/gazette/17.pdf").exists());
    }

    #[tokio::test]
    async fn test_directory_marks_emit_complete() {
        let fixture = Fixture::new(&pipeline("{}"));
        let ctx = fixture.context("store", true);
        let mut item = item(&ctx, b"x", "https://example.com/x.pdf");
        item.insert(EMIT_CACHE_KEY.to_string(), json!("store_ops/emit/abc"));
        ctx.execute(item).await.unwrap();

        let check = fixture.context("store", true);
        assert!(check.check_tag("store_ops/emit/abc").unwrap());
    }

    #[tokio::test]
    async fn test_directory_skips_failed_responses() {
        let fixture = Fixture::new(&pipeline("{}"));
        let ctx = fixture.context("store", false);
        let mut item = item(&ctx, b"x", "https://example.com/x.pdf");
        item.insert("status_code".to_string(), json!(500));
        ctx.execute(item).await.unwrap();
        assert!(fixture.queued().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_archive() {
        let fixture = Fixture::new(&pipeline("{}").replace("\"directory\"", "\"cleanup_archive\""));
        let ctx = fixture.context("store", false);
        let hash = ctx.store_data(b"temp").unwrap();
        ctx.execute(data(json!({ "content_hash": hash }))).await.unwrap();
        assert!(!fixture.services.archive.exists(&hash));
    }
}
