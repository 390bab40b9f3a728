//! SlideGraph - Declarative Task Graph for Slide Prediction
//!
//! Turns directories of whole-slide images into class predictions by
//! running four external tools per dataset:
//!
//! ```text
//! tile_images -> combine_jpeg_dir -> make_tf_record -> predict
//! ```
//!
//! Each stage is a rule template with input and output path patterns.
//! Requesting a dataset's prediction directory resolves the chain of jobs
//! needed to build it, skipping any whose output is already up to date.
//!
//! # Architecture
//!
//! - [`workflow`]: discovery, configuration, rules, resolution, scheduling state
//! - [`execution`]: the engine and single-job runner
//! - [`monitoring`]: resource usage and execution timeline
//! - [`error`]: error types
//!
//! # Example
//!
//! ```rust,no_run
//! use slidegraph::execution::Engine;
//! use slidegraph::workflow::{
//!     build_registry, discover_datasets, final_targets, load_config, LocalStorage, Resolver,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = load_config("pipeline.yaml".as_ref())?;
//!     config.absolutize(&std::env::current_dir()?);
//!
//!     let datasets = discover_datasets(&config.input_root)?;
//!     let registry = build_registry(&config, &datasets)?;
//!     let targets = final_targets(&config, datasets.names());
//!     let graph = Resolver::new(&registry, &LocalStorage).resolve_all(&targets)?;
//!
//!     let mut engine = Engine::new(graph);
//!     engine.set_max_parallel(config.max_parallel);
//!     engine.run()?.into_result()?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

pub use error::{
    ConfigError, DiscoveryError, EngineError, JobExecutionError, PatternError, ResolveError,
    StateError,
};
pub use execution::engine::{Engine, RunSummary};
pub use workflow::parser::{load_config, PipelineConfig};
pub use workflow::resolver::Resolver;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "SlideGraph";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Datasets, RuleTemplate, Stage};
    use std::path::Path;

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "SlideGraph");
    }

    #[test]
    fn test_module_exports_rule_template() {
        let rule = RuleTemplate::parse("copy", &["a/{x}"], "b/{x}", "cp {input} {output}").unwrap();
        assert_eq!(rule.name, "copy");
        assert!(rule.match_output(Path::new("b/1")).is_some());
    }

    #[test]
    fn test_default_pipeline_has_four_stages() {
        let mut config = PipelineConfig::default();
        config.absolutize(Path::new("/project"));
        let datasets = Datasets::from_names("/project/slides", ["ds1".to_string()]);

        let registry = workflow::build_registry(&config, &datasets).unwrap();
        for stage in Stage::ALL {
            assert!(registry.get(stage.rule_name()).is_some());
        }
    }
}
