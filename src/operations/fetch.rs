//! HTTP operations: fetch, session setup and POST requests

use crate::context::{should_skip_incremental, Context};
use crate::helpers::pagination::paginated_url;
use crate::helpers::template::{format_string, render_template, value_to_string};
use crate::http::{HttpRequest, HttpResponse};
use crate::pipeline::Operation;
use crate::rules::Rule;
use crate::{Data, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Data field counting fetch attempts across retries
const RETRY_ATTEMPT: &str = "retry_attempt";

const DEFAULT_RETRIES: i64 = 3;

/// Fetches a URL and passes the response metadata on
///
/// The URL is the `url` param (with placeholders filled from the item) or
/// the item's `url`. Relative URLs are resolved against the `base_url`
/// param or the item's `url`.
///
/// # Params
///
/// * `headers` - Extra headers for the run's session
/// * `pagination.param` - Query parameter set to the item's `page`
/// * `rewrite` - `{ method = "replace", data = [old, new] }` or
///   `{ method = "template", data = "..." }`
/// * `rules` - Only responses matching this rule are passed on
/// * `emit_errors` - Pass on responses with an error status too
/// * `retry` - Attempts for network failures (default 3), with exponential
///   back-off between them
/// * `skip_incremental` - Skip items a later stage already completed
pub struct Fetch;

#[async_trait]
impl Operation for Fetch {
    async fn execute(&self, ctx: &Context, mut data: Data) -> Result<()> {
        if should_skip_incremental(ctx, &mut data, None)? {
            return Ok(());
        }
        apply_headers(ctx);

        let Some(url) = fetch_url(ctx, &data)? else {
            tracing::error!("No URL specified");
            return Ok(());
        };
        let url = match absolute_url(ctx, &data, &url) {
            Some(url) => url,
            None => {
                tracing::info!("Fetch skipped. Invalid URL: {:?}", url);
                return Ok(());
            }
        };
        if !matches!(url.scheme(), "http" | "https") {
            tracing::info!("Fetch skipped. Unsupported scheme: {}", url);
            return Ok(());
        }

        let attempt = data
            .remove(RETRY_ATTEMPT)
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        match fetch(ctx, url.as_str(), &mut data).await {
            Ok(true) => ctx.emit(data),
            Ok(false) => Ok(()),
            Err(err) if err.is_transient() => {
                let retries = ctx.get_i64("retry").unwrap_or(DEFAULT_RETRIES);
                if retries >= attempt as i64 {
                    tracing::warn!("Retry: {} (error: {})", url, err);
                    data.insert(RETRY_ATTEMPT.to_string(), Value::from(attempt + 1));
                    let delay = Duration::from_secs(2u64.saturating_pow(attempt.min(16) as u32));
                    ctx.recurse(data, Some(delay))
                } else {
                    ctx.emit_warning(&format!("Fetch fail [{}]: {}", url, err));
                    Ok(())
                }
            }
            Err(err) => Err(err),
        }
    }
}

/// Sends the request and merges the response into the item
///
/// Returns false when the item should not be passed on.
async fn fetch(ctx: &Context, url: &str, data: &mut Data) -> Result<bool> {
    let mut response = ctx.http.request(HttpRequest::get(url).lazy(true)).await?;

    let rule = Rule::parse_or_default(ctx.params().get("rules"))?;
    let subject = response.subject_for(&rule).await?;
    if !rule.apply(&subject) {
        tracing::info!("Fetch skip: {}", url);
        return Ok(false);
    }

    response.evaluate().await?;
    if response.ok() {
        tracing::info!(
            "Fetched [{}]: {}",
            status_label(&response),
            response.url().unwrap_or_default()
        );
    } else {
        ctx.emit_warning(&format!(
            "Fetch fail [{}]: HTTP {}",
            response.url().unwrap_or_default(),
            status_label(&response)
        ));
        if !ctx.get_bool("emit_errors", false) {
            return Ok(false);
        }
    }

    data.extend(response.serialize().await?);
    Ok(true)
}

fn status_label(response: &HttpResponse) -> String {
    response
        .status_code()
        .map(|status| status.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// The URL to fetch before resolution, with pagination and rewrites applied
fn fetch_url(ctx: &Context, data: &Data) -> Result<Option<String>> {
    let Some(mut url) = target_url(ctx, data)? else {
        return Ok(None);
    };

    if let Some(Value::Object(pagination)) = ctx.get("pagination") {
        if let Some(param) = pagination.get("param").and_then(Value::as_str) {
            let page = data.get("page").and_then(Value::as_i64).unwrap_or(1);
            url = paginated_url(&url, page, param)?;
        }
    }

    if let Some(Value::Object(rewrite)) = ctx.get("rewrite") {
        let method = rewrite.get("method").and_then(Value::as_str);
        match (method, rewrite.get("data")) {
            (Some("replace"), Some(Value::Array(pair))) if pair.len() == 2 => {
                url = url.replace(&value_to_string(&pair[0]), &value_to_string(&pair[1]));
            }
            (Some("template"), Some(Value::String(template))) => {
                url = render_template(template, data);
            }
            _ => ctx.emit_warning(&format!("Ignoring invalid rewrite: {:?}", rewrite)),
        }
    }
    Ok(Some(url).filter(|url| !url.trim().is_empty()))
}

/// The `url` param filled from the item, else the item's own `url`
fn target_url(ctx: &Context, data: &Data) -> Result<Option<String>> {
    match ctx.get_str("url") {
        Some(template) => Ok(Some(format_string(&template, data)?)),
        None => Ok(data.get("url").and_then(Value::as_str).map(str::to_string)),
    }
}

fn absolute_url(ctx: &Context, data: &Data, url: &str) -> Option<Url> {
    match Url::parse(url) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = ctx
                .get_str("base_url")
                .or_else(|| data.get("url").and_then(Value::as_str).map(str::to_string))?;
            Url::parse(&base).ok()?.join(url).ok()
        }
        Err(_) => None,
    }
}

fn apply_headers(ctx: &Context) {
    if let Some(Value::Object(headers)) = ctx.get("headers") {
        for (name, value) in &headers {
            ctx.http.set_header(name, &value_to_string(value));
        }
    }
}

/// POST body: the `data` param plus item fields mapped by `use_data`
/// (`{ post_key = "data_key" }`), without null values
fn post_data(ctx: &Context, data: &Data) -> Data {
    let mut body = match ctx.get("data") {
        Some(Value::Object(map)) => map,
        _ => Data::new(),
    };
    if let Some(Value::Object(mapping)) = ctx.get("use_data") {
        for (post_key, data_key) in mapping {
            if let Some(value) = data_key.as_str().and_then(|key| data.get(key)) {
                body.insert(post_key, value.clone());
            }
        }
    }
    body.retain(|_, value| !value.is_null());
    body
}

/// Configures the run's HTTP session for later stages
///
/// The session is reset, then `user`/`password` (basic auth), `user_agent`,
/// `url` (sent as `Referer`) and `proxy` are applied and the session is
/// saved. The item is passed on unchanged.
pub struct Session;

#[async_trait]
impl Operation for Session {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        ctx.http.reset()?;

        if let (Some(user), Some(password)) = (ctx.get_str("user"), ctx.get_str("password")) {
            ctx.http.set_basic_auth(&user, Some(&password));
        }
        if let Some(user_agent) = ctx.get_str("user_agent") {
            ctx.http.set_header("User-Agent", &user_agent);
        }
        if let Some(referer) = ctx.get_str("url") {
            ctx.http.set_header("Referer", &referer);
        }
        if let Some(proxy) = ctx.get_str("proxy") {
            ctx.http.set_proxy(Some(proxy));
        }

        ctx.http.save()?;
        ctx.emit(data)
    }
}

/// POSTs form data and passes the item on with the response merged in
pub struct Post;

#[async_trait]
impl Operation for Post {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        send_post(ctx, data, false).await
    }
}

/// POSTs a JSON body and passes the item on with the response merged in
pub struct PostJson;

#[async_trait]
impl Operation for PostJson {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        send_post(ctx, data, true).await
    }
}

async fn send_post(ctx: &Context, mut data: Data, json: bool) -> Result<()> {
    apply_headers(ctx);
    let Some(url) = target_url(ctx, &data)? else {
        ctx.emit_warning("No URL for POST request");
        return Ok(());
    };

    let body = post_data(ctx, &data);
    tracing::debug!("POST to {}: {:?}", url, body);
    let mut response = if json {
        ctx.http.post_json(&url, Value::Object(body)).await?
    } else {
        ctx.http.post_form(&url, &body).await?
    };
    data.extend(response.serialize().await?);
    ctx.emit(data)
}
