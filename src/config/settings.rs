use crate::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Process-wide settings
///
/// Built once at start-up and shared by `Arc` with the loader, the workers,
/// every [`Context`](crate::Context) and the HTTP layer. Values come from
/// the defaults below, then an optional TOML file, then `SUMI_*` environment
/// variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for the database, archive, stored output and scratch space
    pub base_path: PathBuf,

    /// Directory holding pipeline files
    pub config_path: Option<PathBuf>,

    /// SQLite database; defaults to `<base_path>/sumi.sqlite3`
    pub database: Option<PathBuf>,

    /// Enables emit sampling and direct (proxy-less) HTTP
    pub debug: bool,

    pub incremental: bool,

    pub continue_on_error: bool,

    /// Days until incremental markers are considered stale
    pub expire: u64,

    /// Requests per minute per host
    pub http_rate_limit: u32,

    pub http_cache: bool,

    /// Seconds
    pub http_timeout: u64,

    pub user_agent: String,

    pub http_proxy: Option<String>,

    /// Attempts after the first before a job is given up
    pub job_retries: u32,

    /// Reject pipelines routing to stages that do not exist
    pub strict_handlers: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            config_path: None,
            database: None,
            debug: false,
            incremental: true,
            continue_on_error: false,
            expire: 1,
            http_rate_limit: 120,
            http_cache: true,
            http_timeout: 30,
            user_agent: format!("sumi-pipeline/{}", env!("CARGO_PKG_VERSION")),
            http_proxy: None,
            job_retries: 3,
            strict_handlers: false,
        }
    }
}

impl Settings {
    /// Loads settings from an optional file and the process environment
    ///
    /// # Arguments
    ///
    /// * `path` - Optional TOML settings file
    ///
    /// # Returns
    ///
    /// * `Ok(Settings)` - Merged settings
    /// * `Err(ConfigError)` - The file could not be read or an environment
    ///   value could not be parsed
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`Settings::load`] with an explicit environment lookup
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            None => Settings::default(),
        };
        settings.apply_env(lookup)?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SUMI_BASE_PATH") {
            self.base_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SUMI_CONFIG_PATH") {
            self.config_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SUMI_DATABASE") {
            self.database = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SUMI_DEBUG") {
            self.debug = parse_bool("SUMI_DEBUG", &v)?;
        }
        if let Some(v) = lookup("SUMI_INCREMENTAL") {
            self.incremental = parse_bool("SUMI_INCREMENTAL", &v)?;
        }
        if let Some(v) = lookup("SUMI_CONTINUE_ON_ERROR") {
            self.continue_on_error = parse_bool("SUMI_CONTINUE_ON_ERROR", &v)?;
        }
        if let Some(v) = lookup("SUMI_EXPIRE") {
            self.expire = parse_number("SUMI_EXPIRE", &v)?;
        }
        if let Some(v) = lookup("SUMI_HTTP_RATE_LIMIT") {
            self.http_rate_limit = parse_number("SUMI_HTTP_RATE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("SUMI_HTTP_CACHE") {
            self.http_cache = parse_bool("SUMI_HTTP_CACHE", &v)?;
        }
        if let Some(v) = lookup("SUMI_HTTP_TIMEOUT") {
            self.http_timeout = parse_number("SUMI_HTTP_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SUMI_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("SUMI_HTTP_PROXY") {
            self.http_proxy = Some(v).filter(|p| !p.trim().is_empty());
        }
        if let Some(v) = lookup("SUMI_JOB_RETRIES") {
            self.job_retries = parse_number("SUMI_JOB_RETRIES", &v)?;
        }
        if let Some(v) = lookup("SUMI_STRICT_HANDLERS") {
            self.strict_handlers = parse_bool("SUMI_STRICT_HANDLERS", &v)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout == 0 {
            return Err(ConfigError::Validation(
                "http_timeout must be greater than 0".to_string(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Validation(
                "user_agent cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.base_path.join("sumi.sqlite3"))
    }

    pub fn archive_path(&self) -> PathBuf {
        self.base_path.join("archive")
    }

    /// Root of the `directory` storage operation, one folder per pipeline
    pub fn store_path(&self) -> PathBuf {
        self.base_path.join("store")
    }

    /// Parent of per-context scratch directories
    pub fn work_path(&self) -> PathBuf {
        self.base_path.join("work")
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::Validation(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::Validation(format!("{} must be a number, got {:?}", key, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::load_with(None, env(&[])).unwrap();
        assert!(settings.incremental);
        assert!(!settings.continue_on_error);
        assert_eq!(settings.http_rate_limit, 120);
        assert_eq!(settings.job_retries, 3);
        assert_eq!(settings.database_path(), PathBuf::from("./data/sumi.sqlite3"));
        assert!(settings.user_agent.starts_with("sumi-pipeline/"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "base_path = \"/srv/crawl\"\nhttp_timeout = 5\nincremental = false"
        )
        .unwrap();

        let settings = Settings::load_with(
            Some(file.path()),
            env(&[("SUMI_HTTP_TIMEOUT", "12"), ("SUMI_DEBUG", "yes")]),
        )
        .unwrap();

        assert_eq!(settings.base_path, PathBuf::from("/srv/crawl"));
        assert_eq!(settings.http_timeout, 12);
        assert!(!settings.incremental);
        assert!(settings.debug);
        assert_eq!(settings.archive_path(), PathBuf::from("/srv/crawl/archive"));
    }

    #[test]
    fn test_invalid_env_value() {
        let result = Settings::load_with(None, env(&[("SUMI_JOB_RETRIES", "many")]));
        assert!(matches!(result, Err(ConfigError::Validation(_))));

        let result = Settings::load_with(None, env(&[("SUMI_INCREMENTAL", "maybe")]));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = Settings::load_with(None, env(&[("SUMI_HTTP_TIMEOUT", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_proxy_is_none() {
        let settings = Settings::load_with(None, env(&[("SUMI_HTTP_PROXY", " ")])).unwrap();
        assert!(settings.http_proxy.is_none());
    }
}
