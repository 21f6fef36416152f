use crate::http::{HttpInner, HttpRequest};
use crate::rules::{in_group, normalize_mimetype, Rule, Subject};
use crate::{Data, Result, SumiError};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::StatusCode;
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// MIME groups whose content is never parsed as HTML
const NON_HTML_GROUPS: &[&str] = &["images", "media", "archives"];

/// Serializable identity of a response
///
/// This is what travels in item data between stages and what is cached for
/// conditional requests. The body itself stays in the archive under
/// `content_hash`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseMeta {
    pub request_id: Option<String>,
    pub status_code: Option<u16>,
    pub url: Option<String>,
    pub content_hash: Option<String>,
    pub encoding: Option<String>,

    /// Lowercased header names
    pub headers: BTreeMap<String, String>,
    pub retrieved_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl ResponseMeta {
    fn from_live(response: &reqwest::Response, request_id: String) -> Self {
        let headers = lowercase_headers(response.headers());
        let encoding = headers
            .get("content-type")
            .and_then(|ct| charset(ct));
        let modified_at = headers.get("last-modified").and_then(|v| parse_http_date(v));
        Self {
            request_id: Some(request_id),
            status_code: Some(response.status().as_u16()),
            url: Some(response.url().to_string()),
            content_hash: None,
            encoding,
            headers,
            retrieved_at: None,
            modified_at,
        }
    }
}

/// A lazily evaluated HTTP response
///
/// Before evaluation only the request is known. [`evaluate`](Self::evaluate)
/// sends it (or reuses cached metadata on `304 Not Modified`);
/// [`fetch`](Self::fetch) streams the body into the archive and fixes the
/// `content_hash`. The `text`, `html`, `xml`, `json` and `raw` views read
/// the archived body and require a prior `fetch`.
pub struct HttpResponse {
    http: Arc<HttpInner>,
    request: Option<HttpRequest>,
    live: Option<reqwest::Response>,
    evaluated: bool,
    cacheable: bool,
    meta: ResponseMeta,
    raw: Option<Vec<u8>>,
    text: Option<String>,
}

impl HttpResponse {
    pub(crate) fn new(http: Arc<HttpInner>, request: HttpRequest) -> Self {
        let cacheable = http.cache && request.is_cacheable();
        Self {
            http,
            request: Some(request),
            live: None,
            evaluated: false,
            cacheable,
            meta: ResponseMeta::default(),
            raw: None,
            text: None,
        }
    }

    /// Rebuilds a response from serialized metadata without any network
    /// access
    pub(crate) fn deserialize(http: Arc<HttpInner>, data: &Data) -> Result<Self> {
        let mut meta: ResponseMeta = serde_json::from_value(Value::Object(data.clone()))?;
        meta.headers = meta
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Ok(Self {
            http,
            request: None,
            live: None,
            evaluated: true,
            cacheable: false,
            meta,
            raw: None,
            text: None,
        })
    }

    /// Sends the request if that has not happened yet
    ///
    /// For cacheable requests with cached metadata the request carries
    /// `If-Modified-Since`/`If-None-Match`; a `304` answer then adopts the
    /// cached metadata, including its content hash, instead of the live
    /// response.
    pub async fn evaluate(&mut self) -> Result<()> {
        if self.evaluated {
            return Ok(());
        }
        let Some(request) = self.request.clone() else {
            self.evaluated = true;
            return Ok(());
        };

        let url = request.full_url()?;
        let request_id = request.request_id()?;
        let cached = if self.cacheable {
            self.http.cached_meta(&request_id)?
        } else {
            None
        };

        let (client, mut headers) = self.http.prepare(&request, &url)?;
        if let Some(cached) = &cached {
            add_conditional_headers(&mut headers, cached);
        }

        self.http.rate_limit_for(&url).enforce().await?;

        let mut builder = client
            .request(request.method.clone(), url.clone())
            .headers(headers);
        if let Some((body, content_type)) = request.encoded_body()? {
            if let Some(content_type) = content_type {
                builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
            }
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        tracing::debug!("{} {}", request.method, url);
        let response = builder
            .send()
            .await
            .map_err(|e| SumiError::http(url.as_str(), e))?;
        self.http.record_response(response.url(), response.headers())?;

        match cached {
            Some(cached) if response.status() == StatusCode::NOT_MODIFIED => {
                tracing::info!("Using cached HTTP response: {}", url);
                self.meta = cached;
                self.live = None;
            }
            _ => {
                self.meta = ResponseMeta::from_live(&response, request_id);
                self.live = Some(response);
            }
        }
        self.evaluated = true;
        Ok(())
    }

    /// Streams the body into the archive and returns its content hash
    ///
    /// Calling it again returns the same hash without touching the network.
    /// Successful cacheable responses are recorded for later conditional
    /// requests.
    pub async fn fetch(&mut self) -> Result<Option<String>> {
        if let Some(hash) = &self.meta.content_hash {
            return Ok(Some(hash.clone()));
        }
        self.evaluate().await?;
        let Some(mut live) = self.live.take() else {
            return Ok(self.meta.content_hash.clone());
        };

        let url = live.url().to_string();
        let mut file = tempfile::NamedTempFile::new_in(&self.http.work_dir)?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = live
            .chunk()
            .await
            .map_err(|e| SumiError::http(url.as_str(), e))?
        {
            hasher.update(&chunk);
            file.write_all(&chunk)?;
        }
        file.flush()?;

        let hash = hex::encode(hasher.finalize());
        self.http.archive.store_file(file.path(), Some(&hash))?;
        self.meta.content_hash = Some(hash.clone());
        self.meta.retrieved_at = Some(Utc::now());

        if self.cacheable && self.ok() {
            self.http.store_meta(&self.meta)?;
        }
        Ok(Some(hash))
    }

    /// Metadata as item data
    ///
    /// Fetches the body first so that the content hash is included.
    pub async fn serialize(&mut self) -> Result<Data> {
        self.fetch().await?;
        match serde_json::to_value(&self.meta)? {
            Value::Object(mut map) => {
                map.retain(|_, v| !v.is_null());
                Ok(map)
            }
            _ => Ok(Data::new()),
        }
    }

    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub fn ok(&self) -> bool {
        self.meta.status_code.map_or(false, |status| status < 400)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.meta.status_code
    }

    /// Final URL after redirects, or the request URL before evaluation
    pub fn url(&self) -> Option<String> {
        self.meta.url.clone().or_else(|| {
            self.request
                .as_ref()
                .and_then(|r| r.full_url().ok())
                .map(|u| u.to_string())
        })
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.meta.headers
    }

    pub fn content_type(&self) -> String {
        normalize_mimetype(self.meta.headers.get("content-type").map(String::as_str))
    }

    pub fn encoding(&self) -> Option<String> {
        self.meta.encoding.clone().or_else(|| {
            self.meta
                .headers
                .get("content-type")
                .and_then(|ct| charset(ct))
        })
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.meta.content_hash.as_deref()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.meta.modified_at.or_else(|| {
            self.meta
                .headers
                .get("last-modified")
                .and_then(|v| parse_http_date(v))
        })
    }

    /// File name from `Content-Disposition`, else the last URL path segment
    pub fn file_name(&self) -> Option<String> {
        if let Some(disposition) = self.meta.headers.get("content-disposition") {
            if let Some(name) = disposition_file_name(disposition) {
                return Some(name);
            }
        }
        let url = url::Url::parse(&self.url()?).ok()?;
        url.path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(str::to_string)
    }

    pub fn local_path(&self) -> Result<PathBuf> {
        let hash = self
            .content_hash()
            .ok_or_else(|| SumiError::Parse("No content available".to_string()))?;
        Ok(self.http.archive.local_path(hash)?)
    }

    /// Archived body bytes, `None` before `fetch`
    pub fn raw(&mut self) -> Result<Option<&[u8]>> {
        if self.raw.is_none() {
            if let Some(hash) = self.meta.content_hash.clone() {
                let mut reader = self.http.archive.open(&hash)?;
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                self.raw = Some(bytes);
            }
        }
        Ok(self.raw.as_deref())
    }

    /// Body decoded with the declared charset, UTF-8 by default
    pub fn text(&mut self) -> Result<Option<&str>> {
        if self.text.is_none() {
            let label = self.encoding();
            let decoded = self.raw()?.map(|bytes| decode(bytes, label.as_deref()));
            self.text = decoded;
        }
        Ok(self.text.as_deref())
    }

    /// Body text suitable for HTML parsing
    ///
    /// `None` for binary content types and empty bodies. A leading XML
    /// declaration is removed since HTML parsers reject or misread it.
    pub fn html_text(&mut self) -> Result<Option<String>> {
        if self.meta.content_hash.is_none() {
            return Ok(None);
        }
        let content_type = self.content_type();
        if NON_HTML_GROUPS.iter().any(|g| in_group(g, &content_type))
            || content_type == "application/pdf"
            || content_type == "application/json"
        {
            return Ok(None);
        }
        let Some(text) = self.text()? else {
            return Ok(None);
        };
        let text = strip_xml_declaration(text);
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(text.to_string()))
    }

    /// Parsed HTML document
    ///
    /// `Html` is not `Send`; do not keep it across an `.await`.
    pub fn html(&mut self) -> Result<Option<Html>> {
        Ok(self.html_text()?.map(|text| Html::parse_document(&text)))
    }

    /// Parsed XML document, `None` when the body is not well-formed XML
    pub fn xml(&mut self) -> Result<Option<sxd_document::Package>> {
        let Some(text) = self.text()? else {
            return Ok(None);
        };
        match sxd_document::parser::parse(text) {
            Ok(package) => Ok(Some(package)),
            Err(e) => {
                tracing::debug!("Response is not well-formed XML: {:?}", e);
                Ok(None)
            }
        }
    }

    /// Body parsed as JSON
    ///
    /// # Errors
    ///
    /// [`SumiError::Parse`] when there is no body (failed or unfetched
    /// download) or it is not valid JSON.
    pub fn json(&mut self) -> Result<Value> {
        let Some(raw) = self.raw()? else {
            return Err(SumiError::Parse("Cannot parse failed download.".to_string()));
        };
        serde_json::from_slice(raw).map_err(|e| SumiError::Parse(e.to_string()))
    }

    /// What a rule sees of this response
    ///
    /// Headers and body are only loaded when the rule looks at them, so
    /// URL-only rules never trigger a request.
    pub async fn subject_for(&mut self, rule: &Rule) -> Result<Subject> {
        if rule.inspects_headers() {
            self.evaluate().await?;
        }
        let mut subject = Subject {
            url: self.url(),
            content_type: None,
            text: None,
        };
        if rule.inspects_headers() {
            subject.content_type = Some(self.content_type());
        }
        if rule.inspects_body() {
            self.fetch().await?;
            subject.text = self.text()?.map(str::to_string);
        }
        Ok(subject)
    }
}

fn add_conditional_headers(headers: &mut HeaderMap, cached: &ResponseMeta) {
    if let Some(value) = cached
        .headers
        .get("last-modified")
        .and_then(|v| v.parse().ok())
    {
        headers.insert(IF_MODIFIED_SINCE, value);
    }
    if let Some(value) = cached.headers.get("etag").and_then(|v| v.parse().ok()) {
        headers.insert(IF_NONE_MATCH, value);
    }
}

fn lowercase_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

fn charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_lowercase())
            .filter(|v| !v.is_empty())
    })
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn disposition_file_name(disposition: &str) -> Option<String> {
    disposition.split(';').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        let key = key.trim().to_ascii_lowercase();
        if key != "filename" && key != "filename*" {
            return None;
        }
        let value = value.trim().trim_matches('"');
        // RFC 5987: charset''percent-encoded
        let value = match value.split_once("''") {
            Some((_, encoded)) => url::form_urlencoded::parse(format!("x={}", encoded).as_bytes())
                .next()
                .map(|(_, v)| v.into_owned())
                .unwrap_or_else(|| encoded.to_string()),
            None => value.to_string(),
        };
        (!value.is_empty()).then_some(value)
    })
}

fn decode(bytes: &[u8], label: Option<&str>) -> String {
    let encoding = label
        .and_then(|l| encoding_rs::Encoding::for_label(l.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

fn strip_xml_declaration(text: &str) -> &str {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return &trimmed[end + 2..];
        }
    }
    text
}
