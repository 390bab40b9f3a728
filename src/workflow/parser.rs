//! Pipeline Configuration
//!
//! Loads the pipeline configuration from YAML. Every field has a default,
//! so an empty file (or no file at all) describes the standard four-stage
//! slide prediction pipeline.
//!
//! # Example YAML Format
//!
//! ```yaml
//! input_root: slides
//! output_root: predictions
//! max_parallel: 4
//!
//! tiling:
//!   tile_size: 512
//!   jobs: 8
//!
//! predict:
//!   checkpoint_dir: /models/inception/run1
//!   class_count: 3
//!
//! rules:
//!   - name: summarize
//!     input: predictions/{dataset}
//!     output: reports/{dataset}.txt
//!     command: summarize.sh {input} > {output}
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_yaml::Value;

use super::model::{CommandTemplate, RuleTemplate, WorkDir};
use super::wildcards::Pattern;
use crate::error::ConfigError;

/// Default share of tiles assigned to the test set. The pipeline only
/// evaluates a pretrained model, so every tile is a test tile.
pub const DEFAULT_PERCENT_TEST: u32 = 100;

/// Default share of tiles assigned to the validation set.
pub const DEFAULT_PERCENT_VALID: u32 = 0;

/// Default configuration file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "pipeline.yaml";

/// Name of the journal file inside the state directory.
pub const JOURNAL_FILE: &str = "journal.json";

/// Top-level pipeline configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory holding one subdirectory per dataset.
    pub input_root: PathBuf,
    /// Where per-dataset predictions are written.
    pub output_root: PathBuf,
    /// Where intermediate stage outputs live.
    pub work_root: PathBuf,
    /// Where the run journal is kept.
    pub state_dir: PathBuf,
    pub max_parallel: usize,
    pub fail_fast: bool,
    /// File-name pattern for dataset metadata files.
    pub metadata_pattern: String,
    pub tiling: TilingParams,
    pub sort_split: SortSplitParams,
    pub record_build: RecordBuildParams,
    pub predict: PredictParams,
    /// Additional user-defined rules.
    pub rules: Vec<RuleSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("slides"),
            output_root: PathBuf::from("predictions"),
            work_root: PathBuf::from("work"),
            state_dir: PathBuf::from(".slidegraph"),
            max_parallel: num_cpus::get().max(1),
            fail_fast: false,
            metadata_pattern: "metadata.{tag}.json".to_string(),
            tiling: TilingParams::default(),
            sort_split: SortSplitParams::default(),
            record_build: RecordBuildParams::default(),
            predict: PredictParams::default(),
            rules: Vec::new(),
        }
    }
}

/// Slide tiling stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TilingParams {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub tile_size: u32,
    pub overlap: u32,
    /// Worker processes used by the tiler; also the job's thread count.
    pub jobs: usize,
    /// Maximum background percentage for a tile to be kept.
    pub background_threshold: u32,
    pub magnification: f64,
    /// Glob for slide images inside a dataset directory.
    pub image_glob: String,
}

impl Default for TilingParams {
    fn default() -> Self {
        Self {
            tool: "python3 00_preprocessing/0b_tileLoop_deepzoom.py".to_string(),
            command: None,
            tile_size: 299,
            overlap: 0,
            jobs: 32,
            background_threshold: 50,
            magnification: 20.0,
            image_glob: "*/*.svs".to_string(),
        }
    }
}

/// Tile sorting and train/validation/test split stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SortSplitParams {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub threads: usize,
    pub magnification: f64,
    pub mag_diff_allowed: f64,
    pub sorting_option: u32,
    pub percent_test: u32,
    pub percent_valid: u32,
    /// Number of leading characters of a slide name forming the patient ID.
    pub patient_id_width: u32,
    pub n_split: u32,
}

impl Default for SortSplitParams {
    fn default() -> Self {
        Self {
            tool: "python3 00_preprocessing/0d_SortTiles.py".to_string(),
            command: None,
            threads: 1,
            magnification: 20.0,
            mag_diff_allowed: 0.0,
            sorting_option: 10,
            percent_test: DEFAULT_PERCENT_TEST,
            percent_valid: DEFAULT_PERCENT_VALID,
            patient_id_width: 12,
            n_split: 0,
        }
    }
}

/// Serialized record building stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecordBuildParams {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub threads: usize,
    /// Write one record file per tile instead of per slide.
    pub one_record_per_tile: bool,
    pub basename: String,
}

impl Default for RecordBuildParams {
    fn default() -> Self {
        Self {
            tool: "python3 00_preprocessing/TFRecord_2or3_Classes/build_TF_test.py".to_string(),
            command: None,
            threads: 4,
            one_record_per_tile: false,
            basename: "test".to_string(),
        }
    }
}

/// Model evaluation stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PredictParams {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub threads: usize,
    pub checkpoint_dir: PathBuf,
    pub batch_size: u32,
    pub class_count: u32,
    pub mode: String,
    pub tv_mode: String,
    pub image_set_basename: String,
    pub run_once: bool,
}

impl Default for PredictParams {
    fn default() -> Self {
        Self {
            tool: "python3 02_testing/xClasses/nc_imagenet_eval.py".to_string(),
            command: None,
            threads: 1,
            checkpoint_dir: PathBuf::from("checkpoints"),
            batch_size: 200,
            class_count: 2,
            mode: "0_softmax".to_string(),
            tv_mode: "test".to_string(),
            image_set_basename: "test_".to_string(),
            run_once: true,
        }
    }
}

/// A user-defined rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub name: String,

    /// Input pattern(s)
    #[serde(deserialize_with = "single_or_vec", default)]
    pub input: Vec<String>,

    pub output: String,

    pub command: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,

    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub workdir: WorkDir,

    /// The output is a directory.
    #[serde(default)]
    pub directory: bool,
}

fn default_threads() -> usize {
    1
}

/// Accepts a single string or a list of strings.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Sequence(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("expected string in input list")),
            })
            .collect(),
        _ => Err(de::Error::custom("expected string or list of strings")),
    }
}

/// Renders a YAML scalar as command text.
fn param_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

impl RuleSpec {
    /// Builds the rule template this entry describes.
    pub fn to_template(&self) -> Result<RuleTemplate, ConfigError> {
        let pattern_err = |source| ConfigError::Pattern {
            rule: self.name.clone(),
            source,
        };

        let mut rule = RuleTemplate::new(
            self.name.as_str(),
            Pattern::parse(&self.output).map_err(pattern_err)?,
            CommandTemplate::parse(&self.command).map_err(pattern_err)?,
        )
        .with_threads(self.threads)
        .with_workdir(self.workdir);

        for input in &self.input {
            rule = rule.with_input(Pattern::parse(input).map_err(pattern_err)?);
        }
        for (name, value) in &self.params {
            rule = rule.with_param(name.as_str(), param_text(value));
        }
        if self.directory || self.workdir == WorkDir::Output {
            rule = rule.with_directory_output();
        }

        Ok(rule)
    }
}

impl PipelineConfig {
    /// Parses a configuration from YAML text. `path` is only used in errors.
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Serializes the effective configuration.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Resolves relative roots against `base`.
    ///
    /// The sort/split stage runs inside its output directory, so every
    /// path handed to a tool must be absolute.
    pub fn absolutize(&mut self, base: &Path) {
        for path in [
            &mut self.input_root,
            &mut self.output_root,
            &mut self.work_root,
            &mut self.state_dir,
            &mut self.predict.checkpoint_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn tiles_dir(&self) -> PathBuf {
        self.work_root.join("tiles")
    }

    pub fn sorted_dir(&self) -> PathBuf {
        self.work_root.join("sorted")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.work_root.join("records")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join(JOURNAL_FILE)
    }
}

/// Loads a pipeline configuration from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use slidegraph::workflow::load_config;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_config("pipeline.yaml".as_ref())?;
///     println!("Datasets under {}", config.input_root.display());
///     Ok(())
/// }
/// ```
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    info!("Loading pipeline config from: {}", path.display());

    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Config loaded ({} bytes)", text.len());

    let config = PipelineConfig::from_yaml(&text, path)?;
    info!("Parsed config with {} custom rule(s)", config.rules.len());
    Ok(config)
}
