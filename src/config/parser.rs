use crate::config::types::PipelineFile;
use crate::config::validation::validate;
use crate::Result;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and validates a pipeline file
///
/// # Arguments
///
/// * `path` - Path to the TOML pipeline file
/// * `strict_handlers` - Treat handler targets that name no stage as errors
///
/// # Returns
///
/// * `Ok(PipelineFile)` - Successfully loaded and validated definition
/// * `Err(SumiError)` - Failed to read, parse or validate the file; rule
///   specifications that do not parse are reported as rule errors
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use sumi_pipeline::config::load_pipeline_file;
///
/// let file = load_pipeline_file(Path::new("pipelines/gazette.toml"), false).unwrap();
/// println!("{} has {} stages", file.name, file.pipeline.len());
/// ```
pub fn load_pipeline_file(path: &Path, strict_handlers: bool) -> Result<PipelineFile> {
    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    let file: PipelineFile = toml::from_str(&content).map_err(ConfigError::Parse)?;
    validate(&file, strict_handlers)?;
    Ok(file)
}

/// Computes a SHA-256 hash of a pipeline file
///
/// The hash is logged with each run so that changed definitions can be told
/// apart in the logs.
pub fn compute_config_hash(path: &Path) -> std::result::Result<String, ConfigError> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}
