//! HTTP fetch and cache layer
//!
//! [`ContextHttp`] is the HTTP handle of a [`Context`](crate::Context). It
//! carries the run's session (cookies, headers, auth, proxy), applies the
//! per-host rate limit, and answers repeat GET requests with conditional
//! headers built from cached response metadata. Response bodies are
//! streamed into the content-addressed archive; see [`HttpResponse`].

mod rate_limit;
mod response;
mod session;
mod user_agent;

pub use rate_limit::RateLimit;
pub use response::{HttpResponse, ResponseMeta};
pub use session::{SessionState, StoredCookie};
pub use user_agent::random_user_agent;

use crate::config::Settings;
use crate::context::{Services, Tags};
use crate::helpers::template::value_to_string;
use crate::pipeline::{Pipeline, Stage};
use crate::storage::{Archive, CounterStore};
use crate::url::make_url_key;
use crate::{Data, Result, SumiError};
use cookie_store::CookieStore;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Per-process cache of HTTP clients, one per proxy setting
#[derive(Clone, Default)]
pub struct ClientCache {
    clients: Arc<Mutex<HashMap<Option<String>, reqwest::Client>>>,
}

impl ClientCache {
    /// Returns the client for a proxy, building it on first use
    pub fn get(&self, settings: &Settings, proxy: Option<&str>) -> Result<reqwest::Client> {
        let key = proxy.map(str::to_string);
        if let Some(client) = self.clients.lock().get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout))
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(10))
            .gzip(true)
            .brotli(true);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| SumiError::http(proxy, e))?);
        }
        let client = builder
            .build()
            .map_err(|e| SumiError::http(proxy.unwrap_or("client"), e))?;

        Ok(self.clients.lock().entry(key).or_insert(client).clone())
    }
}

/// Body of an outgoing request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
    Json(Value),
    Raw(Vec<u8>),
}

/// An HTTP request description
///
/// ```
/// use sumi_pipeline::http::HttpRequest;
///
/// let request = HttpRequest::get("https://example.com/search")
///     .query("q", "gazette")
///     .header("Accept", "text/html")
///     .lazy(true);
/// assert_eq!(request.full_url().unwrap().as_str(), "https://example.com/search?q=gazette");
/// ```
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub auth: Option<(String, Option<String>)>,
    pub timeout: Option<Duration>,

    /// Defer sending until the response is first inspected
    pub lazy: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            auth: None,
            timeout: None,
            lazy: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Form body from a data map; values are rendered as strings
    pub fn form(mut self, data: &Data) -> Self {
        let pairs = data
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect();
        self.body = Some(RequestBody::Form(pairs));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(RequestBody::Raw(body));
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.auth = Some((username.into(), password));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// The URL with the query parameters appended
    pub fn full_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }

    /// Encoded body bytes and their content type
    pub fn encoded_body(&self) -> Result<Option<(Vec<u8>, Option<&'static str>)>> {
        Ok(match &self.body {
            None => None,
            Some(RequestBody::Form(pairs)) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs.iter())
                    .finish();
                Some((
                    encoded.into_bytes(),
                    Some("application/x-www-form-urlencoded"),
                ))
            }
            Some(RequestBody::Json(value)) => {
                Some((serde_json::to_vec(value)?, Some("application/json")))
            }
            Some(RequestBody::Raw(bytes)) => Some((bytes.clone(), None)),
        })
    }

    /// Fingerprint of method, URL and body used as the cache key
    pub fn request_id(&self) -> Result<String> {
        let url = self.full_url()?;
        let body = self.encoded_body()?;
        Ok(make_url_key(
            url.as_str(),
            self.method.as_str(),
            body.as_ref().map(|(bytes, _)| bytes.as_slice()),
        ))
    }

    fn is_cacheable(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

#[derive(Default)]
struct HttpState {
    session: SessionState,
    cookies: CookieStore,
}

/// Shared part of a context's HTTP layer, also held by its responses
pub(crate) struct HttpInner {
    pub(crate) tags: Tags,
    pub(crate) archive: Arc<dyn Archive>,
    counters: Arc<dyn CounterStore>,
    pub(crate) settings: Arc<Settings>,
    clients: ClientCache,
    session_key: Option<String>,
    pub(crate) cache: bool,
    rate_limit: u32,
    user_agent: String,
    pub(crate) work_dir: PathBuf,
    state: Mutex<HttpState>,
}

impl HttpInner {
    fn cache_key(&self, request_id: &str) -> Option<String> {
        self.tags.make_key(&[request_id], Some("cache"))
    }

    pub(crate) fn cached_meta(&self, request_id: &str) -> Result<Option<ResponseMeta>> {
        let Some(key) = self.cache_key(request_id) else {
            return Ok(None);
        };
        Ok(self
            .tags
            .get(&key)?
            .and_then(|value| serde_json::from_value(value).ok()))
    }

    pub(crate) fn store_meta(&self, meta: &ResponseMeta) -> Result<()> {
        let Some(key) = meta.request_id.as_deref().and_then(|id| self.cache_key(id)) else {
            return Ok(());
        };
        self.tags.set(&key, &serde_json::to_value(meta)?)
    }

    pub(crate) fn rate_limit_for(&self, url: &Url) -> RateLimit {
        let host = url.host_str().unwrap_or_default();
        RateLimit::per_minute(self.counters.clone(), format!("http/{}", host), self.rate_limit)
    }

    /// Picks the client and builds the session headers for a request
    pub(crate) fn prepare(
        &self,
        request: &HttpRequest,
        url: &Url,
    ) -> Result<(reqwest::Client, HeaderMap)> {
        let mut state = self.state.lock();
        if let Some((username, password)) = &request.auth {
            state.session.set_basic_auth(username, password.as_deref());
        }

        let proxy = if self.settings.debug {
            None
        } else {
            state
                .session
                .proxy
                .clone()
                .or_else(|| self.settings.http_proxy.clone())
        };
        let client = self.clients.get(&self.settings, proxy.as_deref())?;

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "user-agent", &self.user_agent);
        for (name, value) in &state.session.headers {
            insert_header(&mut headers, name, value);
        }
        for (name, value) in &request.headers {
            insert_header(&mut headers, name, value);
        }
        if let Some(auth) = &state.session.auth_header {
            insert_header(&mut headers, "authorization", auth);
        }
        if let Some(cookies) = session::cookie_header(&state.cookies, url) {
            insert_header(&mut headers, "cookie", &cookies);
        }
        Ok((client, headers))
    }

    /// Takes in cookies set by a response and saves the session
    pub(crate) fn record_response(&self, url: &Url, headers: &HeaderMap) -> Result<()> {
        {
            let mut state = self.state.lock();
            for value in headers.get_all(reqwest::header::SET_COOKIE) {
                let Ok(set_cookie) = value.to_str() else {
                    continue;
                };
                if state.cookies.parse(set_cookie, url).is_ok() {
                    state.session.remember_cookie(url, set_cookie);
                }
            }
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(key) = &self.session_key else {
            return Ok(());
        };
        let value = serde_json::to_value(&self.state.lock().session)?;
        self.tags.set(key, &value)
    }
}

pub(crate) fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.trim().as_bytes()),
        HeaderValue::from_str(value.trim()),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!("Ignoring invalid header {:?}", name),
    }
}

/// The HTTP handle of a context
#[derive(Clone)]
pub struct ContextHttp {
    inner: Arc<HttpInner>,
}

impl ContextHttp {
    /// Builds the handle and loads the run's session
    ///
    /// Stage params may override caching (`cache = false`) and the rate
    /// limit (`http_rate_limit`, requests per minute per host).
    pub fn new(
        services: &Services,
        pipeline: &Pipeline,
        stage: &Stage,
        run_id: &str,
        work_dir: &Path,
    ) -> Result<Self> {
        let settings = services.settings.clone();
        let tags = Tags::new(pipeline.name.clone(), services.tags.clone());

        let cache = settings.http_cache
            && stage
                .params
                .get("cache")
                .and_then(Value::as_bool)
                .unwrap_or(true);
        let rate_limit = stage
            .params
            .get("http_rate_limit")
            .and_then(Value::as_u64)
            .map(|n| n.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(settings.http_rate_limit);
        let user_agent = if pipeline.stealthy {
            random_user_agent().to_string()
        } else {
            settings.user_agent.clone()
        };

        let session_key = tags.make_key(&[run_id], Some("session"));
        let session = match &session_key {
            Some(key) => match tags.get(key)? {
                Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                    tracing::warn!("Discarding unreadable session {}: {}", key, e);
                    SessionState::default()
                }),
                None => SessionState::default(),
            },
            None => SessionState::default(),
        };
        let cookies = session.cookie_jar();

        Ok(Self {
            inner: Arc::new(HttpInner {
                tags,
                archive: services.archive.clone(),
                counters: services.counters.clone(),
                settings,
                clients: services.clients.clone(),
                session_key,
                cache,
                rate_limit,
                user_agent,
                work_dir: work_dir.to_path_buf(),
                state: Mutex::new(HttpState { session, cookies }),
            }),
        })
    }

    /// Sends a request, or prepares it when it is lazy
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let lazy = request.lazy;
        let mut response = HttpResponse::new(self.inner.clone(), request);
        if !lazy {
            response.evaluate().await?;
        }
        Ok(response)
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn post_form(&self, url: &str, data: &Data) -> Result<HttpResponse> {
        self.request(HttpRequest::post(url).form(data)).await
    }

    pub async fn post_json(&self, url: &str, body: Value) -> Result<HttpResponse> {
        self.request(HttpRequest::post(url).json(body)).await
    }

    /// Rebuilds a response from metadata carried in an item
    pub fn rehash(&self, data: &Data) -> Result<HttpResponse> {
        HttpResponse::deserialize(self.inner.clone(), data)
    }

    /// Clears cookies, headers, auth and proxy of the session
    pub fn reset(&self) -> Result<()> {
        *self.inner.state.lock() = HttpState::default();
        self.inner.save()
    }

    /// Persists the session for later stages of the run
    pub fn save(&self) -> Result<()> {
        self.inner.save()
    }

    pub fn set_header(&self, name: &str, value: &str) {
        self.inner
            .state
            .lock()
            .session
            .headers
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_basic_auth(&self, username: &str, password: Option<&str>) {
        self.inner
            .state
            .lock()
            .session
            .set_basic_auth(username, password);
    }

    pub fn set_proxy(&self, proxy: Option<String>) {
        self.inner.state.lock().session.proxy = proxy;
    }

    /// A copy of the current session
    pub fn session(&self) -> SessionState {
        self.inner.state.lock().session.clone()
    }

    pub fn rate_limit_for(&self, url: &Url) -> RateLimit {
        self.inner.rate_limit_for(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_depends_on_body_and_query() {
        let plain = HttpRequest::get("https://example.com/a").request_id().unwrap();
        let query = HttpRequest::get("https://example.com/a")
            .query("page", "2")
            .request_id()
            .unwrap();
        let post = HttpRequest::post("https://example.com/a")
            .json(json!({"q": 1}))
            .request_id()
            .unwrap();

        assert_ne!(plain, query);
        assert_ne!(plain, post);
        assert!(plain.starts_with("GET/example.com/a"));
        assert!(post.starts_with("POST/"));
    }

    #[test]
    fn test_form_body_encoding() {
        let mut data = Data::new();
        data.insert("q".into(), json!("a b"));
        data.insert("n".into(), json!(3));
        data.insert("skip".into(), Value::Null);

        let request = HttpRequest::post("https://example.com/").form(&data);
        let (body, content_type) = request.encoded_body().unwrap().unwrap();
        assert_eq!(String::from_utf8(body).unwrap(), "n=3&q=a+b");
        assert_eq!(content_type, Some("application/x-www-form-urlencoded"));
    }

    #[test]
    fn test_invalid_headers_are_skipped() {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "X-Ok", "1");
        insert_header(&mut headers, "bad header", "1");
        insert_header(&mut headers, "X-Newline", "a\nb");
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_cacheable_methods() {
        assert!(HttpRequest::get("https://example.com").is_cacheable());
        assert!(!HttpRequest::post("https://example.com").is_cacheable());
    }
}
