//! Rule and Configuration Validation
//!
//! Checks performed before any resolution happens:
//! - Rule field validation (name, command, threads)
//! - Output wildcards reachable from static inputs
//! - Command placeholders refer to things the rule defines
//! - Stage parameters within range

use std::collections::BTreeSet;

use log::{debug, warn};

use super::model::{InputSpec, Placeholder, RuleTemplate, WorkDir};
use super::parser::PipelineConfig;
use crate::error::ConfigError;

/// Validates a single rule template.
pub fn validate_rule(rule: &RuleTemplate) -> Result<(), ConfigError> {
    if rule.name.trim().is_empty() {
        return Err(ConfigError::EmptyField {
            rule: rule.name.clone(),
            field: "name",
        });
    }

    if rule.command.is_empty() {
        return Err(ConfigError::EmptyField {
            rule: rule.name.clone(),
            field: "command",
        });
    }

    if rule.threads == 0 {
        return Err(ConfigError::InvalidParameter {
            field: format!("{}.threads", rule.name),
            reason: "must be at least 1".to_string(),
        });
    }

    validate_wildcards(rule)?;
    validate_placeholders(rule)?;

    if rule.inputs.is_empty() {
        debug!("Rule '{}' is a source rule (no inputs)", rule.name);
    }

    Ok(())
}

/// Every output wildcard must appear in some static input pattern.
///
/// Rules with no static inputs (source rules, or rules fed only by
/// hooks) take their bindings from the output alone and are exempt.
fn validate_wildcards(rule: &RuleTemplate) -> Result<(), ConfigError> {
    let has_static = rule
        .inputs
        .iter()
        .any(|i| matches!(i.spec, InputSpec::Pattern(_)));
    if !has_static {
        return Ok(());
    }

    let available = rule.input_wildcards();
    for wildcard in rule.output.wildcard_names() {
        if !available.contains(&wildcard) {
            return Err(ConfigError::OutputWildcardNotInInput {
                rule: rule.name.clone(),
                wildcard,
            });
        }
    }
    Ok(())
}

fn validate_placeholders(rule: &RuleTemplate) -> Result<(), ConfigError> {
    let input_names: BTreeSet<&str> = rule
        .inputs
        .iter()
        .filter_map(|i| i.name.as_deref())
        .collect();
    let output_wildcards = rule.output.wildcard_names();
    let unknown = |placeholder: &Placeholder| ConfigError::UnknownPlaceholder {
        rule: rule.name.clone(),
        placeholder: placeholder.key(),
    };

    let mut uses_output = false;
    for placeholder in rule.command.placeholders() {
        match placeholder {
            Placeholder::Input => {
                if rule.inputs.is_empty() {
                    warn!(
                        "Rule '{}': command uses {{input}} but the rule has no inputs",
                        rule.name
                    );
                }
            }
            Placeholder::NamedInput(name) if !input_names.contains(name.as_str()) => {
                return Err(unknown(placeholder));
            }
            Placeholder::Wildcard(name) if !output_wildcards.contains(name) => {
                return Err(unknown(placeholder));
            }
            Placeholder::Param(name) if !rule.params.contains_key(name) => {
                return Err(unknown(placeholder));
            }
            Placeholder::Other(_) => return Err(unknown(placeholder)),
            Placeholder::Output => uses_output = true,
            _ => {}
        }
    }

    if !uses_output && rule.workdir != WorkDir::Output {
        warn!(
            "Rule '{}': command never mentions {{output}}; the tool must know where to write",
            rule.name
        );
    }
    Ok(())
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Validates pipeline-wide and stage parameters.
pub fn validate_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.max_parallel == 0 {
        return Err(invalid("max_parallel", "must be at least 1"));
    }
    if config.tiling.tile_size == 0 {
        return Err(invalid("tiling.tile_size", "must be positive"));
    }
    if config.predict.batch_size == 0 {
        return Err(invalid("predict.batch_size", "must be positive"));
    }
    if config.predict.class_count == 0 {
        return Err(invalid("predict.class_count", "must be positive"));
    }

    let split = &config.sort_split;
    if split.percent_test + split.percent_valid > 100 {
        return Err(invalid(
            "sort_split",
            format!(
                "percent_test ({}) + percent_valid ({}) exceeds 100",
                split.percent_test, split.percent_valid
            ),
        ));
    }

    if config.metadata_pattern.trim().is_empty() {
        return Err(invalid("metadata_pattern", "must not be empty"));
    }

    Ok(())
}
