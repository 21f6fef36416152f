use crate::config::types::PipelineFile;
use crate::rules::Rule;
use crate::{ConfigError, Result};

/// Stage params that hold rule specifications
const RULE_PARAMS: &[&str] = &["rules", "store"];

/// Checks a pipeline or stage name against `^[A-Za-z0-9_-]+$`
pub fn validate_name(kind: &'static str, name: &str) -> std::result::Result<(), ConfigError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validates a pipeline definition
///
/// Names, methods and rule specifications are always enforced. Handler
/// targets that name no stage are logged, or rejected when
/// `strict_handlers` is set; at run time an emit to such a target is a
/// no-op.
pub fn validate(file: &PipelineFile, strict_handlers: bool) -> Result<()> {
    validate_name("pipeline", &file.name)?;

    if file.pipeline.is_empty() {
        return Err(ConfigError::Validation(format!("pipeline {} has no stages", file.name)).into());
    }

    for (stage_name, stage) in &file.pipeline {
        validate_name("stage", stage_name)?;

        if stage.method.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "stage {} has an empty method",
                stage_name
            ))
            .into());
        }

        for key in RULE_PARAMS {
            if let Some(spec) = stage.params.get(*key) {
                Rule::parse(spec)?;
            }
        }
    }

    if !file.pipeline.contains_key(&file.init) {
        tracing::warn!(
            "Pipeline {} has no init stage {:?}; it can only be started explicitly",
            file.name,
            file.init
        );
    }

    for target in dangling_handlers(file) {
        if strict_handlers {
            return Err(ConfigError::Validation(format!(
                "pipeline {} routes to unknown stage {}",
                file.name, target
            ))
            .into());
        }
        tracing::warn!(
            "Pipeline {} routes to unknown stage {}; emits there are dropped",
            file.name,
            target
        );
    }

    Ok(())
}

/// Lists `stage -> target` edges whose target is not a stage of the pipeline
pub fn dangling_handlers(file: &PipelineFile) -> Vec<String> {
    file.pipeline
        .iter()
        .flat_map(|(name, stage)| {
            stage
                .handle
                .values()
                .filter(|target| !file.pipeline.contains_key(*target))
                .map(move |target| format!("{} -> {}", name, target))
        })
        .collect()
}
