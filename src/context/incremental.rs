//! Target-stage skip-ahead
//!
//! An early stage (typically `fetch`) can ask whether a later stage
//! (typically `store`) has already completed for the item's identifier:
//!
//! ```toml
//! [pipeline.fetch.params.skip_incremental]
//! target = "store"
//!
//! [pipeline.fetch.params.skip_incremental.key]
//! data = ["document_id", "url"]
//! urlpattern = "https://example.com/doc/.*"
//! xpath = "//meta[@name='id']/@content"
//! ```
//!
//! The identifier is the first of: a present data key, the URL when it
//! matches `urlpattern`, the XPath result over the item's cached response,
//! and finally the URL itself. The marker is only written when the target
//! stage finishes for that identifier.

use crate::context::Context;
use crate::helpers::template::value_to_string;
use crate::helpers::xpath::extract_xpath;
use crate::url::join_key;
use crate::{Data, Result};
use regex::RegexBuilder;
use serde_json::{json, Value};

/// Data field carrying the pending marker to the target stage
pub const SKIP_INCREMENTAL: &str = "skip_incremental";

const DEFAULT_TARGET: &str = "store";

/// Checks whether the target stage already completed for this item
///
/// When an identifier can be derived, `data` gains a `skip_incremental`
/// entry naming the marker so that the target stage can set it later.
///
/// # Arguments
///
/// * `ctx` - The running context
/// * `data` - The item; updated with the pending marker
/// * `config` - Explicit configuration, otherwise the stage's
///   `skip_incremental` param
///
/// # Returns
///
/// `true` if the stage should skip this item
pub fn should_skip_incremental(
    ctx: &Context,
    data: &mut Data,
    config: Option<&Value>,
) -> Result<bool> {
    if !ctx.state.incremental {
        return Ok(false);
    }

    let config = match config.cloned().or_else(|| ctx.get(SKIP_INCREMENTAL)) {
        Some(Value::Object(config)) => config,
        Some(Value::Bool(true)) => Data::new(),
        _ => return Ok(false),
    };
    let key_config = config
        .get("key")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut identifier = data_identifier(data, key_config.get("data"));

    if identifier.is_none() {
        if let (Some(pattern), Some(url)) = (
            key_config.get("urlpattern").and_then(Value::as_str),
            data.get("url").and_then(Value::as_str),
        ) {
            let regex = RegexBuilder::new(&format!("^(?:{})", pattern))
                .build()
                .map_err(|e| crate::SumiError::Regex {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                })?;
            if regex.is_match(url) {
                identifier = Some(url.to_string());
            }
        }
    }

    if identifier.is_none() {
        if let Some(expr) = key_config.get("xpath").and_then(Value::as_str) {
            identifier = xpath_identifier(ctx, data, expr)?;
        }
    }

    let identifier = identifier.or_else(|| {
        data.get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
    });
    let Some(identifier) = identifier else {
        return Ok(false);
    };

    let target = config
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_TARGET)
        .to_string();
    let Some(key) = join_key([SKIP_INCREMENTAL, identifier.as_str(), target.as_str()]) else {
        return Ok(false);
    };

    data.insert(
        SKIP_INCREMENTAL.to_string(),
        json!({"target": target, "key": key}),
    );

    if ctx.check_tag(&key)? {
        tracing::info!("Skipping (incremental): {}", key);
        return Ok(true);
    }
    Ok(false)
}

/// Sets the pending marker if the current stage is its target
pub fn mark_incremental_complete(ctx: &Context, data: &Data) -> Result<()> {
    let Some(pending) = data.get(SKIP_INCREMENTAL).and_then(Value::as_object) else {
        return Ok(());
    };
    let target = pending.get("target").and_then(Value::as_str);
    let key = pending.get("key").and_then(Value::as_str);

    if let (Some(target), Some(key)) = (target, key) {
        if target == ctx.stage.name {
            ctx.set_tag(key, &Value::Bool(true))?;
            tracing::debug!("Marked incremental complete: {}", key);
        }
    }
    Ok(())
}

fn data_identifier(data: &Data, keys: Option<&Value>) -> Option<String> {
    let keys: Vec<&str> = match keys {
        Some(Value::String(key)) => vec![key.as_str()],
        Some(Value::Array(keys)) => keys.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    keys.into_iter()
        .filter_map(|key| data.get(key))
        .find(|value| !value.is_null())
        .map(value_to_string)
}

fn xpath_identifier(ctx: &Context, data: &Data, expr: &str) -> Result<Option<String>> {
    if data.get("content_hash").and_then(Value::as_str).is_none() {
        return Ok(None);
    }
    let mut response = ctx.http.rehash(data)?;
    let text = match response.html_text()? {
        Some(text) => text,
        None => return Ok(None),
    };
    extract_xpath(&text, expr)
}
