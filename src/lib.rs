//! Sumi-Pipeline: a crawl-pipeline execution engine
//!
//! This crate runs named graphs of processing stages over a stream of work
//! items. Each stage invocation is dispatched through a job queue, executed
//! inside a per-invocation [`Context`](context::Context), and may emit new
//! items to downstream stages. Around that loop the crate provides incremental
//! completion tracking, an HTTP fetch/cache layer with persisted sessions,
//! per-host rate limiting and a small rule language for filtering responses.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod helpers;
pub mod http;
pub mod operations;
pub mod pipeline;
pub mod rules;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Payload carried between stages
pub type Data = serde_json::Map<String, serde_json::Value>;

/// Main error type for Sumi-Pipeline operations
#[derive(Debug, Error)]
pub enum SumiError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rule parsing error: {0}")]
    RuleParsing(#[from] rules::RuleError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Metadata error: {0}")]
    MetaData(String),

    #[error("Regex error for {pattern:?}: {message}")]
    Regex { pattern: String, message: String },

    #[error("XPath error: {0}")]
    XPath(String),

    #[error("Rate limit exceeded for {resource}")]
    RateLimit { resource: String },

    #[error("Content missing from archive: {content_hash}")]
    StorageMissing { content_hash: String },

    #[error("HTTP error for {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("Storage error: {0}")]
    Storage(storage::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SumiError {
    /// Wraps a reqwest error together with the URL it was raised for
    pub fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }

    /// Returns true for network failures that are worth retrying
    ///
    /// Timeouts, refused connections and interrupted bodies qualify. Builder
    /// errors and invalid URLs do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_timeout()
                    || source.is_connect()
                    || source.is_request()
                    || source.is_body()
            }
            Self::Io(_) => true,
            _ => false,
        }
    }
}

impl From<storage::StorageError> for SumiError {
    fn from(err: storage::StorageError) -> Self {
        match err {
            storage::StorageError::Missing(content_hash) => Self::StorageMissing { content_hash },
            other => Self::Storage(other),
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("Stage {stage:?} has an unresolvable method {method:?}")]
    UnknownOperation { stage: String, method: String },

    #[error("Pipeline {pipeline:?} has no stage {stage:?}")]
    MissingStage { pipeline: String, stage: String },
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,
}

/// Result type alias for Sumi-Pipeline operations
pub type Result<T> = std::result::Result<T, SumiError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Settings;
pub use context::{Context, Emit, Services};
pub use dispatch::{Job, Worker};
pub use pipeline::{Operation, OperationRegistry, Pipeline, PipelineLoader, Stage};
pub use rules::Rule;
