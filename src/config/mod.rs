//! Configuration module for Sumi-Pipeline
//!
//! This module handles process [`Settings`] and the TOML pipeline files that
//! describe each crawl graph.
//!
//! # Example
//!
//! ```no_run
//! use sumi_pipeline::config::{load_pipeline_file, Settings};
//! use std::path::Path;
//!
//! let settings = Settings::load(None).unwrap();
//! let file = load_pipeline_file(Path::new("pipelines/gazette.toml"), settings.strict_handlers).unwrap();
//! println!("Pipeline {} starts at {}", file.name, file.init);
//! ```

mod parser;
mod settings;
mod types;
mod validation;

pub use parser::{compute_config_hash, load_pipeline_file};
pub use settings::Settings;
pub use types::{AggregatorConfig, PipelineFile, StageConfig};
pub use validation::{dangling_handlers, validate, validate_name};
