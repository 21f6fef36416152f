//! Request fingerprints and tag key helpers

use sha2::{Digest, Sha256};
use url::Url;

/// Returns the hex encoded SHA-256 digest of some bytes
pub fn hash_data(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// Joins key parts with `/`, dropping empty parts and surrounding slashes
///
/// Returns None when nothing is left to join.
///
/// ```
/// use sumi_pipeline::url::join_key;
///
/// assert_eq!(join_key(["a/", "", "/b"]), Some("a/b".to_string()));
/// assert_eq!(join_key(["", "/"]), None);
/// ```
pub fn join_key<I, S>(parts: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parts: Vec<String> = parts
        .into_iter()
        .map(|part| part.as_ref().trim_matches('/').to_string())
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Builds a hierarchical fingerprint for a request
///
/// The key has the shape `METHOD/host/path/[hash(query)]/[hash(body)]/hash(url)`
/// so that all entries for one host or path share a common prefix. Strings
/// that do not parse as URLs are hashed as a whole.
///
/// # Arguments
///
/// * `url` - The full request URL, including the query string
/// * `method` - HTTP method, uppercased in the key
/// * `body` - Optional request body
pub fn make_url_key(url: &str, method: &str, body: Option<&[u8]>) -> String {
    let method = if method.is_empty() {
        "GET".to_string()
    } else {
        method.to_uppercase()
    };

    let mut parts = vec![method];
    if let Ok(parsed) = Url::parse(url) {
        let mut netloc = parsed.host_str().unwrap_or_default().to_string();
        if let Some(port) = parsed.port() {
            netloc = format!("{}:{}", netloc, port);
        }
        parts.push(netloc);
        parts.push(parsed.path().to_string());
        if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
            parts.push(hash_data(query));
        }
    }
    if let Some(body) = body.filter(|b| !b.is_empty()) {
        parts.push(hash_data(body));
    }
    parts.push(hash_data(url));

    join_key(parts).unwrap_or_else(|| hash_data(url))
}
