//! Rule engine for filtering responses
//!
//! A rule is a small boolean expression over a response's URL, content type
//! and body. Rules are written as nested single-key mappings in pipeline
//! files:
//!
//! ```toml
//! [pipeline.fetch.params.rules]
//! and = [
//!     { domain = "example.com" },
//!     { not = { or = [{ mime_group = "images" }, { pattern = ".*\\.zip$" }] } },
//! ]
//! ```
//!
//! Parsing is strict: every mapping must have exactly one known key, so a
//! malformed rule fails the pipeline load instead of silently matching.

mod mime;

pub use mime::{in_group, normalize_mimetype, DEFAULT_MIMETYPE, GROUPS};

use crate::helpers::xpath::xpath_matches;
use crate::url::{domain_matches, extract_domain, normalize_domain};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while parsing a rule specification
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Not a valid rule: {0}")]
    NotAMapping(String),

    #[error("Empty rule specification")]
    Empty,

    #[error("Ambiguous rule (multiple keys): {0}")]
    Ambiguous(String),

    #[error("Unknown rule type: {0}")]
    UnknownKind(String),

    #[error("'{kind}' rule requires {expected}")]
    InvalidValue {
        kind: String,
        expected: &'static str,
    },

    #[error("Invalid pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// What a rule can look at
///
/// `content_type` must already be normalized (see [`normalize_mimetype`]).
pub trait RuleSubject {
    fn url(&self) -> Option<&str>;
    fn content_type(&self) -> Option<&str>;
    fn text(&self) -> Option<&str>;
}

/// An owned snapshot of the attributes a rule inspects
#[derive(Debug, Clone, Default)]
pub struct Subject {
    pub url: Option<String>,
    pub content_type: Option<String>,
    pub text: Option<String>,
}

impl RuleSubject for Subject {
    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

/// A parsed rule expression
#[derive(Debug, Clone)]
pub enum Rule {
    /// All children match
    And(Vec<Rule>),
    /// At least one child matches
    Or(Vec<Rule>),
    Not(Box<Rule>),
    /// Always true; used when no rule is configured
    MatchAll,
    /// Host equals the domain or is a subdomain of it
    Domain(String),
    /// Exact normalized MIME type
    MimeType(String),
    /// MIME type in a named group, or with the group as top-level type
    MimeGroup(String),
    /// Case-insensitive regex matched at the start of the URL
    Pattern(Regex),
    /// XPath that selects at least one node of the body
    XPath(String),
}

impl Default for Rule {
    fn default() -> Self {
        Rule::MatchAll
    }
}

impl Rule {
    /// Parses a rule from its single-key mapping form
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] for non-mappings, empty or multi-key
    /// mappings, unknown rule kinds, values of the wrong shape and regex
    /// patterns that do not compile.
    pub fn parse(spec: &Value) -> Result<Rule, RuleError> {
        let map = spec
            .as_object()
            .ok_or_else(|| RuleError::NotAMapping(spec.to_string()))?;

        if map.len() > 1 {
            return Err(RuleError::Ambiguous(spec.to_string()));
        }
        let Some((kind, value)) = map.iter().next() else {
            return Err(RuleError::Empty);
        };

        match kind.as_str() {
            "and" | "all" => Ok(Rule::And(Self::parse_children(kind, value)?)),
            "or" | "any" => Ok(Rule::Or(Self::parse_children(kind, value)?)),
            "not" => {
                if !value.is_object() {
                    return Err(invalid(kind, "a mapping"));
                }
                Ok(Rule::Not(Box::new(Rule::parse(value)?)))
            }
            "match_all" => Ok(Rule::MatchAll),
            "domain" => {
                let domain = clean_domain(scalar(kind, value)?);
                if domain.is_empty() {
                    return Err(invalid(kind, "a non-empty domain"));
                }
                Ok(Rule::Domain(domain))
            }
            "mime_type" => Ok(Rule::MimeType(normalize_mimetype(Some(scalar(kind, value)?)))),
            "mime_group" => Ok(Rule::MimeGroup(scalar(kind, value)?.trim().to_lowercase())),
            "pattern" => {
                let pattern = scalar(kind, value)?;
                let regex = RegexBuilder::new(&format!("^(?:{})", pattern))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| RuleError::InvalidPattern {
                        pattern: pattern.to_string(),
                        message: e.to_string(),
                    })?;
                Ok(Rule::Pattern(regex))
            }
            "xpath" => Ok(Rule::XPath(scalar(kind, value)?.to_string())),
            other => Err(RuleError::UnknownKind(other.to_string())),
        }
    }

    /// Parses an optional spec, falling back to [`Rule::MatchAll`]
    pub fn parse_or_default(spec: Option<&Value>) -> Result<Rule, RuleError> {
        match spec {
            None | Some(Value::Null) => Ok(Rule::MatchAll),
            Some(spec) => Rule::parse(spec),
        }
    }

    fn parse_children(kind: &str, value: &Value) -> Result<Vec<Rule>, RuleError> {
        let children = value.as_array().ok_or_else(|| invalid(kind, "a list"))?;
        children.iter().map(Rule::parse).collect()
    }

    /// Evaluates the rule against a subject
    pub fn apply(&self, subject: &dyn RuleSubject) -> bool {
        match self {
            Rule::And(children) => children.iter().all(|rule| rule.apply(subject)),
            Rule::Or(children) => children.iter().any(|rule| rule.apply(subject)),
            Rule::Not(child) => !child.apply(subject),
            Rule::MatchAll => true,
            Rule::Domain(domain) => subject
                .url()
                .and_then(|url| ::url::Url::parse(url).ok())
                .and_then(|url| extract_domain(&url))
                .map_or(false, |host| domain_matches(domain, &host)),
            Rule::MimeType(mime) => subject.content_type() == Some(mime.as_str()),
            Rule::MimeGroup(group) => subject
                .content_type()
                .map_or(false, |mime| in_group(group, mime)),
            Rule::Pattern(regex) => subject.url().map_or(false, |url| regex.is_match(url)),
            Rule::XPath(expr) => match subject.text() {
                Some(text) if !text.is_empty() => xpath_matches(text, expr),
                _ => false,
            },
        }
    }

    /// True if evaluating the rule needs response headers
    pub fn inspects_headers(&self) -> bool {
        match self {
            Rule::And(children) | Rule::Or(children) => {
                children.iter().any(Rule::inspects_headers)
            }
            Rule::Not(child) => child.inspects_headers(),
            Rule::MimeType(_) | Rule::MimeGroup(_) => true,
            _ => false,
        }
    }

    /// True if evaluating the rule needs the response body
    pub fn inspects_body(&self) -> bool {
        match self {
            Rule::And(children) | Rule::Or(children) => children.iter().any(Rule::inspects_body),
            Rule::Not(child) => child.inspects_body(),
            Rule::XPath(_) => true,
            _ => false,
        }
    }
}

fn invalid(kind: &str, expected: &'static str) -> RuleError {
    RuleError::InvalidValue {
        kind: kind.to_string(),
        expected,
    }
}

fn scalar<'a>(kind: &str, value: &'a Value) -> Result<&'a str, RuleError> {
    value.as_str().ok_or_else(|| invalid(kind, "a string"))
}

/// Accepts either a bare domain or a URL and returns its host
fn clean_domain(value: &str) -> String {
    let host = ::url::Url::parse(value)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| value.to_string());
    normalize_domain(&host)
}
