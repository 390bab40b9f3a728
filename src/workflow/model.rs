//! Rule and Job Data Model
//!
//! A [`RuleTemplate`] describes how to produce any path matching its
//! output pattern. Resolving a concrete target binds the template's
//! wildcards and yields a [`Job`]; all jobs for a request form a
//! [`JobGraph`] in dependency order.
//!
//! # Command placeholders
//!
//! | Placeholder        | Expands to                              |
//! |--------------------|-----------------------------------------|
//! | `{input}`          | all input paths, space-separated        |
//! | `{input.NAME}`     | the paths of one named input            |
//! | `{output}`         | the output path                         |
//! | `{threads}`        | the rule's thread count                 |
//! | `{wildcards.NAME}` | a bound wildcard value                  |
//! | `{params.NAME}`    | a rule parameter                        |
//!
//! `{{` and `}}` produce literal braces.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::catalog::Stage;
use super::wildcards::{Bindings, Pattern};
use crate::error::{ConfigError, PatternError, ResolveError};

/// Computes input paths from wildcard bindings at resolution time.
pub type InputHook = Arc<dyn Fn(&Bindings) -> Vec<PathBuf> + Send + Sync>;

/// How a rule obtains one group of input paths.
#[derive(Clone)]
pub enum InputSpec {
    /// A path pattern filled in from the output's bindings.
    Pattern(Pattern),
    /// Paths discovered by a hook, e.g. the metadata files of a dataset.
    Dynamic { label: String, hook: InputHook },
}

impl fmt::Debug for InputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(pattern) => f.debug_tuple("Pattern").field(pattern).finish(),
            Self::Dynamic { label, .. } => f.debug_struct("Dynamic").field("label", label).finish(),
        }
    }
}

/// An input group, optionally named for `{input.NAME}`.
#[derive(Debug, Clone)]
pub struct NamedInput {
    pub name: Option<String>,
    pub spec: InputSpec,
}

/// Where a job's action runs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkDir {
    /// The engine's working directory.
    #[default]
    Inherit,
    /// Inside the job's output directory, created before the action runs.
    Output,
}

/// What kind of rule a template is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Stage(Stage),
    Custom,
}

/// A command placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Input,
    NamedInput(String),
    Output,
    Threads,
    Wildcard(String),
    Param(String),
    /// Anything else; rejected when the rule is registered.
    Other(String),
}

impl Placeholder {
    fn parse(key: &str) -> Self {
        match key {
            "input" | "inputs" => Self::Input,
            "output" | "outputs" => Self::Output,
            "threads" => Self::Threads,
            _ => {
                if let Some(name) = key.strip_prefix("input.") {
                    Self::NamedInput(name.to_string())
                } else if let Some(name) = key.strip_prefix("wildcards.") {
                    Self::Wildcard(name.to_string())
                } else if let Some(name) = key.strip_prefix("params.") {
                    Self::Param(name.to_string())
                } else {
                    Self::Other(key.to_string())
                }
            }
        }
    }

    /// Text form, as written inside braces.
    pub fn key(&self) -> String {
        match self {
            Self::Input => "input".to_string(),
            Self::NamedInput(name) => format!("input.{}", name),
            Self::Output => "output".to_string(),
            Self::Threads => "threads".to_string(),
            Self::Wildcard(name) => format!("wildcards.{}", name),
            Self::Param(name) => format!("params.{}", name),
            Self::Other(key) => key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Placeholder(Placeholder),
}

/// A parsed shell command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    raw: String,
    tokens: Vec<Token>,
}

/// Values available when rendering a command.
pub struct RenderContext<'a> {
    pub inputs: &'a [InputGroup],
    pub output: &'a Path,
    pub threads: usize,
    pub wildcards: &'a Bindings,
    pub params: &'a BTreeMap<String, String>,
}

impl CommandTemplate {
    /// Parses a command template.
    ///
    /// # Example
    /// ```
    /// use slidegraph::workflow::model::CommandTemplate;
    ///
    /// let cmd = CommandTemplate::parse("awk '{{print $1}}' {input} > {output}").unwrap();
    /// assert_eq!(cmd.placeholders().count(), 2);
    /// ```
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let mut tokens = Vec::new();
        let mut text = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut key = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        key.push(inner);
                    }
                    if !closed {
                        return Err(PatternError::UnbalancedBrace(raw.to_string()));
                    }
                    if !text.is_empty() {
                        tokens.push(Token::Text(std::mem::take(&mut text)));
                    }
                    tokens.push(Token::Placeholder(Placeholder::parse(key.trim())));
                }
                '}' => return Err(PatternError::UnbalancedBrace(raw.to_string())),
                _ => text.push(ch),
            }
        }

        if !text.is_empty() {
            tokens.push(Token::Text(text));
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            tokens,
        })
    }

    /// The template text as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the template has no content.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Iterates over placeholders in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Placeholder(p) => Some(p),
            Token::Text(_) => None,
        })
    }

    /// Renders the command. Fails with the placeholder key that could not
    /// be filled.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<String, String> {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Text(text) => out.push_str(text),
                Token::Placeholder(placeholder) => {
                    let value = match placeholder {
                        Placeholder::Input => join_paths(ctx.inputs.iter().flat_map(|g| &g.paths)),
                        Placeholder::NamedInput(name) => {
                            let group = ctx
                                .inputs
                                .iter()
                                .find(|g| g.name.as_deref() == Some(name.as_str()))
                                .ok_or_else(|| placeholder.key())?;
                            join_paths(group.paths.iter())
                        }
                        Placeholder::Output => ctx.output.display().to_string(),
                        Placeholder::Threads => ctx.threads.to_string(),
                        Placeholder::Wildcard(name) => ctx
                            .wildcards
                            .get(name)
                            .cloned()
                            .ok_or_else(|| placeholder.key())?,
                        Placeholder::Param(name) => ctx
                            .params
                            .get(name)
                            .cloned()
                            .ok_or_else(|| placeholder.key())?,
                        Placeholder::Other(_) => return Err(placeholder.key()),
                    };
                    out.push_str(&value);
                }
            }
        }
        Ok(out.trim().to_string())
    }
}

fn join_paths<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> String {
    paths
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A named rule: input patterns, an output pattern, and an action.
#[derive(Debug, Clone)]
pub struct RuleTemplate {
    pub name: String,
    pub kind: RuleKind,
    pub inputs: Vec<NamedInput>,
    pub output: Pattern,
    pub command: CommandTemplate,
    pub params: BTreeMap<String, String>,
    pub threads: usize,
    pub workdir: WorkDir,
    /// The output is a directory, created before the action runs.
    pub directory_output: bool,
    /// Allowed values per wildcard; unlisted wildcards accept anything.
    pub constraints: BTreeMap<String, BTreeSet<String>>,
}

impl RuleTemplate {
    /// Creates a custom rule with no inputs.
    pub fn new(name: impl Into<String>, output: Pattern, command: CommandTemplate) -> Self {
        Self {
            name: name.into().trim().to_string(),
            kind: RuleKind::Custom,
            inputs: Vec::new(),
            output,
            command,
            params: BTreeMap::new(),
            threads: 1,
            workdir: WorkDir::Inherit,
            directory_output: false,
            constraints: BTreeMap::new(),
        }
    }

    /// Parses a custom rule from pattern strings.
    ///
    /// # Example
    ///
    /// ```
    /// use slidegraph::workflow::RuleTemplate;
    ///
    /// let rule = RuleTemplate::parse(
    ///     "thumbnail",
    ///     &["slides/{dataset}"],
    ///     "thumbs/{dataset}.png",
    ///     "make_thumb {input} {output}",
    /// )
    /// .unwrap()
    /// .with_threads(2);
    /// assert_eq!(rule.inputs.len(), 1);
    /// ```
    pub fn parse(
        name: &str,
        inputs: &[&str],
        output: &str,
        command: &str,
    ) -> Result<Self, ConfigError> {
        let pattern_err = |source| ConfigError::Pattern {
            rule: name.to_string(),
            source,
        };
        let mut rule = Self::new(
            name,
            Pattern::parse(output).map_err(pattern_err)?,
            CommandTemplate::parse(command).map_err(pattern_err)?,
        );
        for input in inputs {
            rule = rule.with_input(Pattern::parse(input).map_err(pattern_err)?);
        }
        Ok(rule)
    }

    /// Adds an unnamed input pattern.
    pub fn with_input(mut self, pattern: Pattern) -> Self {
        self.inputs.push(NamedInput {
            name: None,
            spec: InputSpec::Pattern(pattern),
        });
        self
    }

    /// Adds a named input group.
    pub fn with_named_input(mut self, name: impl Into<String>, spec: InputSpec) -> Self {
        self.inputs.push(NamedInput {
            name: Some(name.into()),
            spec,
        });
        self
    }

    /// Sets a parameter available as `{params.NAME}`.
    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Sets the thread count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets where the action runs.
    pub fn with_workdir(mut self, workdir: WorkDir) -> Self {
        self.workdir = workdir;
        self
    }

    /// Marks the output as a directory.
    pub fn with_directory_output(mut self) -> Self {
        self.directory_output = true;
        self
    }

    /// Restricts a wildcard to a fixed set of values.
    pub fn with_constraint(
        mut self,
        wildcard: impl Into<String>,
        allowed: impl IntoIterator<Item = String>,
    ) -> Self {
        self.constraints
            .insert(wildcard.into(), allowed.into_iter().collect());
        self
    }

    /// Matches a concrete target against the output pattern, honoring
    /// wildcard constraints.
    pub fn match_output(&self, target: &Path) -> Option<Bindings> {
        let bindings = self.output.matches(target)?;
        let allowed = self.constraints.iter().all(|(name, values)| {
            bindings
                .get(name)
                .map_or(true, |value| values.contains(value))
        });
        allowed.then_some(bindings)
    }

    /// Tags the rule with its kind.
    pub fn with_kind(mut self, kind: RuleKind) -> Self {
        self.kind = kind;
        self
    }

    /// Wildcards of all static input patterns.
    pub fn input_wildcards(&self) -> BTreeSet<String> {
        self.inputs
            .iter()
            .filter_map(|i| match &i.spec {
                InputSpec::Pattern(p) => Some(p.wildcard_names()),
                InputSpec::Dynamic { .. } => None,
            })
            .flatten()
            .collect()
    }

    /// Instantiates the inputs for concrete bindings.
    pub fn bind_inputs(&self, bindings: &Bindings) -> Result<Vec<InputGroup>, ResolveError> {
        self.inputs
            .iter()
            .map(|input| {
                let paths = match &input.spec {
                    InputSpec::Pattern(pattern) => {
                        vec![pattern
                            .substitute(bindings)
                            .map_err(|source| ResolveError::Pattern {
                                rule: self.name.clone(),
                                source,
                            })?]
                    }
                    InputSpec::Dynamic { hook, .. } => {
                        let mut paths = hook(bindings);
                        paths.sort();
                        paths.dedup();
                        paths
                    }
                };
                Ok(InputGroup {
                    name: input.name.clone(),
                    paths,
                })
            })
            .collect()
    }
}

/// Concrete paths for one input group of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputGroup {
    pub name: Option<String>,
    pub paths: Vec<PathBuf>,
}

/// Label of a rule instance: the rule name followed by its bindings.
pub fn instance_label(rule: &str, bindings: &Bindings) -> String {
    if bindings.is_empty() {
        return rule.to_string();
    }
    let parts: Vec<String> = bindings
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{}[{}]", rule, parts.join(","))
}

/// Index of a job within its [`JobGraph`].
pub type JobId = usize;

/// Why a job has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    /// Re-run requested explicitly.
    Forced,
    /// The output does not exist.
    MissingOutput,
    /// A previous run started this job but never finished it.
    Incomplete,
    /// An input is newer than the output.
    UpdatedInput(PathBuf),
    /// A job this one depends on will run.
    UpstreamRerun(String),
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => write!(f, "forced"),
            Self::MissingOutput => write!(f, "missing output"),
            Self::Incomplete => write!(f, "incomplete output from a previous run"),
            Self::UpdatedInput(path) => write!(f, "updated input {}", path.display()),
            Self::UpstreamRerun(job) => write!(f, "upstream job {} will run", job),
        }
    }
}

/// A rule instance with its concrete inputs, output and command.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub rule: String,
    pub bindings: Bindings,
    pub inputs: Vec<InputGroup>,
    pub output: PathBuf,
    pub command: String,
    pub threads: usize,
    pub workdir: Option<PathBuf>,
    pub output_is_dir: bool,
    pub deps: Vec<JobId>,
    pub reason: Option<RunReason>,
}

impl Job {
    /// Human-readable identity, e.g. `predict[dataset=ds1]`.
    pub fn label(&self) -> String {
        instance_label(&self.rule, &self.bindings)
    }

    /// All input paths, in declaration order.
    pub fn input_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.inputs.iter().flat_map(|g| g.paths.iter())
    }

    /// True unless the output is already up to date.
    pub fn needs_run(&self) -> bool {
        self.reason.is_some()
    }
}

/// All jobs for a request, in a valid topological order.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    jobs: Vec<Job>,
    targets: Vec<PathBuf>,
}

impl JobGraph {
    pub(crate) fn new(jobs: Vec<Job>, targets: Vec<PathBuf>) -> Self {
        Self { jobs, targets }
    }

    /// Jobs in dependency order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// The requested targets.
    pub fn targets(&self) -> &[PathBuf] {
        &self.targets
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs that must run, in dependency order.
    pub fn pending(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.needs_run())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    /// Jobs that depend directly on `id`.
    pub fn dependents(&self, id: JobId) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| j.deps.contains(&id))
            .map(|j| j.id)
            .collect()
    }

    /// Every job downstream of `id`.
    pub fn transitive_dependents(&self, id: JobId) -> BTreeSet<JobId> {
        let mut found = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if found.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_fixture() -> (Vec<InputGroup>, Bindings, BTreeMap<String, String>) {
        let inputs = vec![
            InputGroup {
                name: Some("tiles".to_string()),
                paths: vec![PathBuf::from("work/tiles/ds1")],
            },
            InputGroup {
                name: Some("metadata".to_string()),
                paths: vec![
                    PathBuf::from("slides/ds1/metadata.a.json"),
                    PathBuf::from("slides/ds1/metadata.b.json"),
                ],
            },
        ];
        let wildcards = Bindings::from([("dataset".to_string(), "ds1".to_string())]);
        let params = BTreeMap::from([("percent_test".to_string(), "100".to_string())]);
        (inputs, wildcards, params)
    }

    #[test]
    fn test_command_render_all_placeholders() {
        let (inputs, wildcards, params) = ctx_fixture();
        let cmd = CommandTemplate::parse(
            "sort --src={input.tiles} --json={input.metadata} --test={params.percent_test} \
             -t {threads} --name {wildcards.dataset} -o {output}",
        )
        .unwrap();
        let rendered = cmd
            .render(&RenderContext {
                inputs: &inputs,
                output: Path::new("work/sorted/ds1"),
                threads: 3,
                wildcards: &wildcards,
                params: &params,
            })
            .unwrap();
        assert_eq!(
            rendered,
            "sort --src=work/tiles/ds1 --json=slides/ds1/metadata.a.json slides/ds1/metadata.b.json \
             --test=100 -t 3 --name ds1 -o work/sorted/ds1"
        );
    }

    #[test]
    fn test_command_render_all_inputs() {
        let (inputs, wildcards, params) = ctx_fixture();
        let cmd = CommandTemplate::parse("cat {input}").unwrap();
        let rendered = cmd
            .render(&RenderContext {
                inputs: &inputs,
                output: Path::new("x"),
                threads: 1,
                wildcards: &wildcards,
                params: &params,
            })
            .unwrap();
        assert_eq!(
            rendered,
            "cat work/tiles/ds1 slides/ds1/metadata.a.json slides/ds1/metadata.b.json"
        );
    }

    #[test]
    fn test_command_escaped_braces() {
        let cmd = CommandTemplate::parse("awk '{{print $1}}' {input}").unwrap();
        let placeholders: Vec<_> = cmd.placeholders().collect();
        assert_eq!(placeholders, vec![&Placeholder::Input]);
    }

    #[test]
    fn test_command_unknown_placeholder_fails_render() {
        let (inputs, wildcards, params) = ctx_fixture();
        let cmd = CommandTemplate::parse("echo {nonsense}").unwrap();
        let err = cmd
            .render(&RenderContext {
                inputs: &inputs,
                output: Path::new("x"),
                threads: 1,
                wildcards: &wildcards,
                params: &params,
            })
            .unwrap_err();
        assert_eq!(err, "nonsense");
    }

    #[test]
    fn test_command_unbalanced() {
        assert!(CommandTemplate::parse("echo {input").is_err());
        assert!(CommandTemplate::parse("echo input}").is_err());
    }

    #[test]
    fn test_rule_parse_and_input_wildcards() {
        let rule = RuleTemplate::parse(
            "combine",
            &["tiles/{dataset}", "meta/{dataset}.json"],
            "sorted/{dataset}",
            "sort {input} {output}",
        )
        .unwrap();
        assert_eq!(rule.kind, RuleKind::Custom);
        assert_eq!(rule.threads, 1);
        assert_eq!(
            rule.input_wildcards().into_iter().collect::<Vec<_>>(),
            vec!["dataset"]
        );
    }

    #[test]
    fn test_bind_inputs_with_dynamic_hook() {
        let hook: InputHook = Arc::new(|b: &Bindings| {
            vec![
                PathBuf::from(format!("meta/{}/b.json", b["dataset"])),
                PathBuf::from(format!("meta/{}/a.json", b["dataset"])),
            ]
        });
        let rule = RuleTemplate::parse("r", &["tiles/{dataset}"], "out/{dataset}", "x")
            .unwrap()
            .with_named_input(
                "metadata",
                InputSpec::Dynamic {
                    label: "metadata".to_string(),
                    hook,
                },
            );
        let bindings = Bindings::from([("dataset".to_string(), "ds1".to_string())]);
        let groups = rule.bind_inputs(&bindings).unwrap();
        assert_eq!(groups[0].paths, vec![PathBuf::from("tiles/ds1")]);
        assert_eq!(
            groups[1].paths,
            vec![
                PathBuf::from("meta/ds1/a.json"),
                PathBuf::from("meta/ds1/b.json")
            ]
        );
    }

    #[test]
    fn test_match_output_honors_constraints() {
        let rule = RuleTemplate::parse("r", &["in/{dataset}"], "out/{dataset}", "x")
            .unwrap()
            .with_constraint("dataset", vec!["ds1".to_string()]);
        assert!(rule.match_output(Path::new("out/ds1")).is_some());
        assert!(rule.match_output(Path::new("out/ds2")).is_none());
    }

    #[test]
    fn test_job_label() {
        let job = Job {
            id: 0,
            rule: "predict".to_string(),
            bindings: Bindings::from([("dataset".to_string(), "ds1".to_string())]),
            inputs: Vec::new(),
            output: PathBuf::from("out/ds1"),
            command: String::new(),
            threads: 1,
            workdir: None,
            output_is_dir: false,
            deps: Vec::new(),
            reason: None,
        };
        assert_eq!(job.label(), "predict[dataset=ds1]");
        assert!(!job.needs_run());
    }

    #[test]
    fn test_run_reason_display() {
        assert_eq!(RunReason::MissingOutput.to_string(), "missing output");
        assert_eq!(
            RunReason::UpdatedInput(PathBuf::from("a")).to_string(),
            "updated input a"
        );
    }
}
