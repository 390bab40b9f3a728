//! Pipeline Catalog
//!
//! The four built-in stages of the slide prediction pipeline and the
//! rule templates that wire them together:
//!
//! ```text
//! <input_root>/{dataset}
//!     -> tile_images       -> <work_root>/tiles/{dataset}
//!     -> combine_jpeg_dir  -> <work_root>/sorted/{dataset}
//!     -> make_tf_record    -> <work_root>/records/{dataset}
//!     -> predict           -> <output_root>/{dataset}
//! ```
//!
//! Every stage output is a directory. The `dataset` wildcard is limited
//! to the datasets discovered at startup.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use super::discovery::Datasets;
use super::model::{CommandTemplate, InputHook, InputSpec, RuleKind, RuleTemplate, WorkDir};
use super::parser::PipelineConfig;
use super::registry::RuleRegistry;
use super::validator::validate_config;
use super::wildcards::{Bindings, Pattern, Segment};
use crate::error::ConfigError;

/// Wildcard naming the dataset in every stage pattern.
pub const DATASET_WILDCARD: &str = "dataset";

pub const TILING_COMMAND: &str = "{params.tool} -s {params.tile_size} -e {params.overlap} \
-j {threads} -B {params.background_threshold} -M {params.magnification} \
-o {output} \"{input.images}/{params.image_glob}\"";

// Runs inside the output directory; the sorter writes to its cwd.
pub const SORT_SPLIT_COMMAND: &str = "{params.tool} --SourceFolder={input.tiles} \
--JsonFile={input.metadata} --Magnification={params.magnification} \
--MagDiffAllowed={params.mag_diff_allowed} --SortingOption={params.sorting_option} \
--PercentTest={params.percent_test} --PercentValid={params.percent_valid} \
--PatientID={params.patient_id_width} --nSplit={params.n_split}";

pub const RECORD_BUILD_COMMAND: &str = "{params.tool} --directory={input} \
--output_directory={output} --num_threads={threads} \
--one_FT_per_Tile={params.one_record_per_tile} --ImageSet_basename={params.basename}";

pub const PREDICT_COMMAND: &str = "{params.tool} --checkpoint_dir={params.checkpoint_dir} \
--eval_dir={output} --data_dir={input} --batch_size={params.batch_size} \
--run_once={params.run_once} --ImageSet_basename={params.image_set_basename} \
--ClassNumber={params.class_count} --mode={params.mode} --TVmode={params.tv_mode}";

/// A built-in pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Tiling,
    SortSplit,
    RecordBuild,
    Predict,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [
        Stage::Tiling,
        Stage::SortSplit,
        Stage::RecordBuild,
        Stage::Predict,
    ];

    /// Name of the rule implementing this stage.
    pub fn rule_name(self) -> &'static str {
        match self {
            Stage::Tiling => "tile_images",
            Stage::SortSplit => "combine_jpeg_dir",
            Stage::RecordBuild => "make_tf_record",
            Stage::Predict => "predict",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Stage::Tiling => "cut slide images into tiles",
            Stage::SortSplit => "sort tiles and split them into test/validation sets",
            Stage::RecordBuild => "serialize sorted tiles into record files",
            Stage::Predict => "evaluate the pretrained classifier on the records",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rule_name())
    }
}

/// Hook listing the metadata files of a dataset.
///
/// Files directly inside `<input_root>/<dataset>` whose name matches
/// `file_pattern` are returned. An unreadable directory yields nothing;
/// the sort/split tool then runs without metadata.
pub fn metadata_hook(input_root: PathBuf, file_pattern: Segment) -> InputHook {
    Arc::new(move |bindings: &Bindings| {
        let Some(dataset) = bindings.get(DATASET_WILDCARD) else {
            return Vec::new();
        };
        let dir = input_root.join(dataset);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list metadata in {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| file_pattern.match_component(name).is_some())
            })
            .map(|entry| entry.path())
            .collect();

        debug!("Dataset '{}': {} metadata file(s)", dataset, files.len());
        files
    })
}

fn stage_command(
    stage: Stage,
    override_command: Option<&str>,
    default: &str,
) -> Result<CommandTemplate, ConfigError> {
    CommandTemplate::parse(override_command.unwrap_or(default)).map_err(|source| {
        ConfigError::Pattern {
            rule: stage.rule_name().to_string(),
            source,
        }
    })
}

fn dataset_pattern(stage: Stage, base: &Path) -> Result<Pattern, ConfigError> {
    Pattern::under(base, &format!("{{{}}}", DATASET_WILDCARD)).map_err(|source| {
        ConfigError::Pattern {
            rule: stage.rule_name().to_string(),
            source,
        }
    })
}

fn stage_rule(
    stage: Stage,
    output_base: &Path,
    command: CommandTemplate,
    datasets: &Datasets,
) -> Result<RuleTemplate, ConfigError> {
    Ok(RuleTemplate::new(
        stage.rule_name(),
        dataset_pattern(stage, output_base)?,
        command,
    )
    .with_kind(RuleKind::Stage(stage))
    .with_directory_output()
    .with_constraint(DATASET_WILDCARD, datasets.names().iter().cloned()))
}

fn metadata_segment(pattern: &str) -> Result<Segment, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidParameter {
        field: "metadata_pattern".to_string(),
        reason,
    };
    if pattern.contains('/') {
        return Err(invalid("must be a file name, not a path".to_string()));
    }
    Segment::parse(pattern).map_err(|e| invalid(e.to_string()))
}

/// Builds the rule template for one stage.
pub fn stage_template(
    stage: Stage,
    config: &PipelineConfig,
    datasets: &Datasets,
) -> Result<RuleTemplate, ConfigError> {
    let rule = match stage {
        Stage::Tiling => {
            let p = &config.tiling;
            let command = stage_command(stage, p.command.as_deref(), TILING_COMMAND)?;
            stage_rule(stage, &config.tiles_dir(), command, datasets)?
                .with_named_input(
                    "images",
                    InputSpec::Pattern(dataset_pattern(stage, &config.input_root)?),
                )
                .with_threads(p.jobs)
                .with_param("tool", &p.tool)
                .with_param("tile_size", p.tile_size)
                .with_param("overlap", p.overlap)
                .with_param("background_threshold", p.background_threshold)
                .with_param("magnification", p.magnification)
                .with_param("image_glob", &p.image_glob)
        }
        Stage::SortSplit => {
            let p = &config.sort_split;
            let command = stage_command(stage, p.command.as_deref(), SORT_SPLIT_COMMAND)?;
            let metadata = metadata_segment(&config.metadata_pattern)?;
            let label = format!(
                "{}/{{dataset}}/{}",
                config.input_root.display(),
                config.metadata_pattern
            );
            stage_rule(stage, &config.sorted_dir(), command, datasets)?
                .with_named_input(
                    "tiles",
                    InputSpec::Pattern(dataset_pattern(stage, &config.tiles_dir())?),
                )
                .with_named_input(
                    "metadata",
                    InputSpec::Dynamic {
                        label,
                        hook: metadata_hook(config.input_root.clone(), metadata),
                    },
                )
                .with_workdir(WorkDir::Output)
                .with_threads(p.threads)
                .with_param("tool", &p.tool)
                .with_param("magnification", p.magnification)
                .with_param("mag_diff_allowed", p.mag_diff_allowed)
                .with_param("sorting_option", p.sorting_option)
                .with_param("percent_test", p.percent_test)
                .with_param("percent_valid", p.percent_valid)
                .with_param("patient_id_width", p.patient_id_width)
                .with_param("n_split", p.n_split)
        }
        Stage::RecordBuild => {
            let p = &config.record_build;
            let command = stage_command(stage, p.command.as_deref(), RECORD_BUILD_COMMAND)?;
            stage_rule(stage, &config.records_dir(), command, datasets)?
                .with_input(dataset_pattern(stage, &config.sorted_dir())?)
                .with_threads(p.threads)
                .with_param("tool", &p.tool)
                .with_param("one_record_per_tile", p.one_record_per_tile)
                .with_param("basename", &p.basename)
        }
        Stage::Predict => {
            let p = &config.predict;
            let command = stage_command(stage, p.command.as_deref(), PREDICT_COMMAND)?;
            stage_rule(stage, &config.output_root, command, datasets)?
                .with_input(dataset_pattern(stage, &config.records_dir())?)
                .with_threads(p.threads)
                .with_param("tool", &p.tool)
                .with_param("checkpoint_dir", p.checkpoint_dir.display())
                .with_param("batch_size", p.batch_size)
                .with_param("class_count", p.class_count)
                .with_param("mode", &p.mode)
                .with_param("tv_mode", &p.tv_mode)
                .with_param("image_set_basename", &p.image_set_basename)
                .with_param("run_once", p.run_once)
        }
    };
    Ok(rule)
}

/// Builds the registry for a configuration: the four stages followed by
/// any custom rules.
pub fn build_registry(
    config: &PipelineConfig,
    datasets: &Datasets,
) -> Result<RuleRegistry, ConfigError> {
    validate_config(config)?;

    let mut registry = RuleRegistry::new();
    for stage in Stage::ALL {
        debug!("Stage {}: {}", stage, stage.description());
        registry.add_rule(stage_template(stage, config, datasets)?)?;
    }
    for spec in &config.rules {
        registry.add_rule(spec.to_template()?)?;
    }

    info!(
        "Registered {} rule(s) ({} custom)",
        registry.len(),
        config.rules.len()
    );
    Ok(registry)
}

/// The final prediction directory of each dataset.
pub fn final_targets(config: &PipelineConfig, datasets: &[String]) -> Vec<PathBuf> {
    datasets
        .iter()
        .map(|name| config.output_root.join(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture() -> (PipelineConfig, Datasets) {
        let mut config = PipelineConfig::default();
        config.absolutize(Path::new("/project"));
        let datasets = Datasets::from_names(
            config.input_root.clone(),
            vec!["ds1".to_string(), "ds2".to_string()],
        );
        (config, datasets)
    }

    #[test]
    fn test_registry_has_four_stages() {
        let (config, datasets) = fixture();
        let registry = build_registry(&config, &datasets).unwrap();
        let names: Vec<_> = registry.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["tile_images", "combine_jpeg_dir", "make_tf_record", "predict"]
        );
        assert!(registry.iter().all(|r| r.directory_output));
    }

    #[test]
    fn test_stage_chain_matches() {
        let (config, datasets) = fixture();
        let registry = build_registry(&config, &datasets).unwrap();

        let (rule, bindings) = registry
            .find_producer(Path::new("/project/predictions/ds1"))
            .unwrap()
            .unwrap();
        assert_eq!(rule.name, "predict");
        assert_eq!(bindings[DATASET_WILDCARD], "ds1");

        let (rule, _) = registry
            .find_producer(Path::new("/project/work/sorted/ds2"))
            .unwrap()
            .unwrap();
        assert_eq!(rule.kind, RuleKind::Stage(Stage::SortSplit));
        assert_eq!(rule.workdir, WorkDir::Output);
    }

    #[test]
    fn test_unknown_dataset_not_produced() {
        let (config, datasets) = fixture();
        let registry = build_registry(&config, &datasets).unwrap();
        assert!(registry
            .find_producer(Path::new("/project/predictions/ds9"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stage_params() {
        let (config, datasets) = fixture();
        let tiling = stage_template(Stage::Tiling, &config, &datasets).unwrap();
        assert_eq!(tiling.threads, 32);
        assert_eq!(tiling.params["tile_size"], "299");
        assert_eq!(tiling.params["magnification"], "20");

        let sort = stage_template(Stage::SortSplit, &config, &datasets).unwrap();
        assert_eq!(sort.params["percent_test"], "100");
        assert_eq!(sort.params["percent_valid"], "0");
        assert_eq!(sort.inputs.len(), 2);

        let predict = stage_template(Stage::Predict, &config, &datasets).unwrap();
        assert_eq!(predict.params["checkpoint_dir"], "/project/checkpoints");
    }

    #[test]
    fn test_command_override() {
        let (mut config, datasets) = fixture();
        config.predict.command = Some("echo {wildcards.dataset} > {output}/out.txt".to_string());
        let predict = stage_template(Stage::Predict, &config, &datasets).unwrap();
        assert_eq!(
            predict.command.as_str(),
            "echo {wildcards.dataset} > {output}/out.txt"
        );
    }

    #[test]
    fn test_custom_rules_appended() {
        let (mut config, datasets) = fixture();
        config.rules.push(
            serde_yaml::from_str(
                "name: report\ninput: predictions/{dataset}\noutput: reports/{dataset}.txt\ncommand: ls {input} > {output}\n",
            )
            .unwrap(),
        );
        let registry = build_registry(&config, &datasets).unwrap();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.get("report").unwrap().kind, RuleKind::Custom);
    }

    #[test]
    fn test_custom_rule_name_clash() {
        let (mut config, datasets) = fixture();
        config.rules.push(
            serde_yaml::from_str(
                "name: predict\ninput: a/{x}\noutput: b/{x}\ncommand: cp {input} {output}\n",
            )
            .unwrap(),
        );
        assert!(matches!(
            build_registry(&config, &datasets),
            Err(ConfigError::DuplicateRule(_))
        ));
    }

    #[test]
    fn test_metadata_hook_lists_matching_files() {
        let temp_dir = tempdir().unwrap();
        let ds = temp_dir.path().join("ds1");
        fs::create_dir(&ds).unwrap();
        fs::write(ds.join("metadata.a.json"), "{}").unwrap();
        fs::write(ds.join("metadata.b.json"), "{}").unwrap();
        fs::write(ds.join("slide.svs"), "x").unwrap();

        let hook = metadata_hook(
            temp_dir.path().to_path_buf(),
            Segment::parse("metadata.{tag}.json").unwrap(),
        );
        let mut bindings = Bindings::new();
        bindings.insert(DATASET_WILDCARD.to_string(), "ds1".to_string());
        let mut files = hook(&bindings);
        files.sort();
        assert_eq!(files, vec![ds.join("metadata.a.json"), ds.join("metadata.b.json")]);

        bindings.insert(DATASET_WILDCARD.to_string(), "missing".to_string());
        assert!(hook(&bindings).is_empty());
    }

    #[test]
    fn test_final_targets() {
        let (config, _) = fixture();
        let targets = final_targets(&config, &["ds2".to_string()]);
        assert_eq!(targets, vec![PathBuf::from("/project/predictions/ds2")]);
    }

    #[test]
    fn test_metadata_pattern_rejects_separator() {
        let (mut config, datasets) = fixture();
        config.metadata_pattern = "meta/{tag}.json".to_string();
        assert!(matches!(
            build_registry(&config, &datasets),
            Err(ConfigError::InvalidParameter { ref field, .. }) if field == "metadata_pattern"
        ));
    }
}
