//! HTTP session state persisted per run
//!
//! Cookies, extra headers, the authorization header and the proxy are
//! written to the tag store after every request. A context built in another
//! process for the same run loads them back, so a login performed by one
//! stage carries over to the stages after it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cookie_store::CookieStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// A `Set-Cookie` header as received, with the URL that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub url: String,
    pub set_cookie: String,
}

impl StoredCookie {
    fn name(&self) -> &str {
        self.set_cookie
            .split(';')
            .next()
            .and_then(|pair| pair.split('=').next())
            .unwrap_or_default()
            .trim()
    }

    fn host(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

/// Serializable session state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub headers: BTreeMap<String, String>,
    pub auth_header: Option<String>,
    pub proxy: Option<String>,
    pub cookies: Vec<StoredCookie>,
}

impl SessionState {
    /// Builds a cookie jar by replaying the stored `Set-Cookie` headers
    pub fn cookie_jar(&self) -> CookieStore {
        let mut jar = CookieStore::default();
        for cookie in &self.cookies {
            match Url::parse(&cookie.url) {
                Ok(url) => {
                    if let Err(e) = jar.parse(&cookie.set_cookie, &url) {
                        tracing::debug!("Dropping stored cookie for {}: {}", cookie.url, e);
                    }
                }
                Err(e) => tracing::debug!("Stored cookie has invalid URL {}: {}", cookie.url, e),
            }
        }
        jar
    }

    /// Remembers a received cookie, replacing an older one of the same
    /// name from the same host
    pub fn remember_cookie(&mut self, url: &Url, set_cookie: &str) {
        let cookie = StoredCookie {
            url: url.to_string(),
            set_cookie: set_cookie.to_string(),
        };
        let (name, host) = (cookie.name().to_string(), cookie.host());
        self.cookies
            .retain(|existing| !(existing.name() == name && existing.host() == host));
        self.cookies.push(cookie);
    }

    /// Sets HTTP basic credentials
    pub fn set_basic_auth(&mut self, username: &str, password: Option<&str>) {
        let credentials = format!("{}:{}", username, password.unwrap_or_default());
        self.auth_header = Some(format!("Basic {}", STANDARD.encode(credentials)));
    }
}

/// Cookie header value for a request to `url`
pub fn cookie_header(jar: &CookieStore, url: &Url) -> Option<String> {
    let pairs: Vec<String> = jar
        .get_request_values(url)
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_cookie_replay() {
        let mut session = SessionState::default();
        session.remember_cookie(&url("https://example.com/login"), "sid=abc; Path=/");
        session.remember_cookie(&url("https://other.org/"), "lang=en; Path=/");

        let jar = session.cookie_jar();
        assert_eq!(
            cookie_header(&jar, &url("https://example.com/docs")).as_deref(),
            Some("sid=abc")
        );
        assert_eq!(
            cookie_header(&jar, &url("https://other.org/")).as_deref(),
            Some("lang=en")
        );
        assert!(cookie_header(&jar, &url("https://unrelated.net/")).is_none());
    }

    #[test]
    fn test_cookie_replaced_by_name_and_host() {
        let mut session = SessionState::default();
        session.remember_cookie(&url("https://example.com/"), "sid=old; Path=/");
        session.remember_cookie(&url("https://example.com/a"), "sid=new; Path=/");
        session.remember_cookie(&url("https://example.com/"), "theme=dark; Path=/");

        assert_eq!(session.cookies.len(), 2);
        let jar = session.cookie_jar();
        let header = cookie_header(&jar, &url("https://example.com/")).unwrap();
        assert!(header.contains("sid=new"));
        assert!(!header.contains("sid=old"));
    }

    #[test]
    fn test_basic_auth() {
        let mut session = SessionState::default();
        session.set_basic_auth("user", Some("pass"));
        assert_eq!(session.auth_header.as_deref(), Some("Basic dXNlcjpwYXNz"));
    }

    #[test]
    fn test_state_serializes() {
        let mut session = SessionState::default();
        session.headers.insert("X-Token".into(), "t".into());
        session.remember_cookie(&url("https://example.com/"), "sid=1");

        let value = serde_json::to_value(&session).unwrap();
        let restored: SessionState = serde_json::from_value(value).unwrap();
        assert_eq!(restored, session);
    }
}
