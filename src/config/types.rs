use crate::Data;
use indexmap::IndexMap;
use serde::Deserialize;

fn default_init() -> String {
    "init".to_string()
}

fn default_expire() -> u64 {
    1
}

/// A pipeline definition as written in its TOML file
///
/// ```toml
/// name = "gazette"
/// description = "Official gazette archive"
/// init = "seed"
///
/// [pipeline.seed]
/// method = "seed"
/// params = { url = "https://example.com/gazette" }
/// handle = { pass = "fetch" }
///
/// [pipeline.fetch]
/// method = "fetch"
/// handle = { pass = "store" }
///
/// [pipeline.store]
/// method = "directory"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFile {
    /// Pipeline name, restricted to `[A-Za-z0-9_-]`
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub category: Option<String>,

    /// Entry stage
    #[serde(default = "default_init")]
    pub init: String,

    /// Seconds to wait before an emitted job becomes runnable
    #[serde(default)]
    pub delay: u64,

    /// Days until incremental markers are considered stale
    #[serde(default = "default_expire")]
    pub expire: u64,

    /// Randomize the user agent of each HTTP session
    #[serde(default)]
    pub stealthy: bool,

    /// Operation run once when a run has drained its queue
    #[serde(default)]
    pub aggregator: Option<AggregatorConfig>,

    /// Stages in document order
    #[serde(default)]
    pub pipeline: IndexMap<String, StageConfig>,
}

/// One stage of a pipeline file
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Operation name: a built-in, `namespace:function` or `path:function`
    pub method: String,

    #[serde(default)]
    pub params: Data,

    /// Rule label to downstream stage name
    #[serde(default)]
    pub handle: IndexMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    pub method: String,

    #[serde(default)]
    pub params: Data,
}
