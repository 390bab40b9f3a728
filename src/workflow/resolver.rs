//! Graph Resolver
//!
//! Expands requested targets into a [`JobGraph`]. Resolution is a
//! depth-first walk from each target through the rules producing its
//! inputs:
//!
//! 1. A target that exists and has no producing rule is a satisfied leaf.
//! 2. Otherwise the single matching rule is bound to the target.
//! 3. Its inputs (static patterns and hooks) are instantiated and resolved
//!    recursively, so dependency jobs are created first.
//! 4. The job is memoized by rule and bindings; each one exists once.
//!
//! Every job then gets a [`RunReason`], or none if its output is already
//! up to date. A job whose dependency must run must itself run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::model::{
    instance_label, InputGroup, Job, JobGraph, JobId, RenderContext, RuleTemplate, RunReason,
    WorkDir,
};
use super::registry::RuleRegistry;
use super::storage::Storage;
use super::wildcards::{normalize_path, Bindings};
use crate::error::ResolveError;

/// Resolves targets against a rule registry and a storage view.
pub struct Resolver<'a> {
    registry: &'a RuleRegistry,
    storage: &'a dyn Storage,
    incomplete: HashSet<PathBuf>,
    force_all: bool,
    forced_rules: HashSet<String>,
}

/// State of one resolution call.
#[derive(Default)]
struct ResolutionRun {
    jobs: Vec<Job>,
    memo: HashMap<(String, Bindings), JobId>,
    /// Targets currently being resolved, outermost first.
    stack: Vec<PathBuf>,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a RuleRegistry, storage: &'a dyn Storage) -> Self {
        Self {
            registry,
            storage,
            incomplete: HashSet::new(),
            force_all: false,
            forced_rules: HashSet::new(),
        }
    }

    /// Outputs a previous run started but never finished. Existing
    /// outputs in this set are treated as stale.
    pub fn with_incomplete(mut self, outputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.incomplete
            .extend(outputs.into_iter().map(|p| normalize_path(&p)));
        self
    }

    /// Re-run every job regardless of freshness.
    pub fn force_all(mut self, force: bool) -> Self {
        self.force_all = force;
        self
    }

    /// Re-run every instance of a rule, and everything downstream of it.
    pub fn force_rule(mut self, name: impl Into<String>) -> Self {
        self.forced_rules.insert(name.into());
        self
    }

    /// Resolves a single target.
    pub fn resolve(&self, target: &Path) -> Result<JobGraph, ResolveError> {
        self.resolve_all(&[target.to_path_buf()])
    }

    /// Resolves several targets into one graph with shared memoization.
    ///
    /// Jobs are returned in a valid topological order. Independent
    /// targets produce independent subgraphs.
    pub fn resolve_all(&self, targets: &[PathBuf]) -> Result<JobGraph, ResolveError> {
        let mut run = ResolutionRun::default();

        for target in targets {
            self.visit(&mut run, target, None)?;
        }

        let graph = JobGraph::new(run.jobs, targets.to_vec());
        info!(
            "Resolved {} target(s) into {} job(s), {} to run",
            targets.len(),
            graph.len(),
            graph.pending_count()
        );
        Ok(graph)
    }

    fn visit(
        &self,
        run: &mut ResolutionRun,
        target: &Path,
        required_by: Option<&str>,
    ) -> Result<Option<JobId>, ResolveError> {
        let target = normalize_path(target);

        if let Some(pos) = run.stack.iter().position(|t| *t == target) {
            let mut chain = run.stack[pos..].to_vec();
            chain.push(target);
            return Err(ResolveError::DependencyCycle { chain });
        }

        let Some((rule, bindings)) = self.registry.find_producer(&target)? else {
            if self.storage.exists(&target) {
                debug!("Leaf input: {}", target.display());
                return Ok(None);
            }
            return Err(ResolveError::UnresolvableTarget {
                target,
                required_by: required_by.map(str::to_string),
            });
        };

        let key = (rule.name.clone(), bindings);
        if let Some(&id) = run.memo.get(&key) {
            return Ok(Some(id));
        }
        let bindings = key.1.clone();
        let label = instance_label(&rule.name, &bindings);

        let inputs = rule.bind_inputs(&bindings)?;

        run.stack.push(target);
        let mut deps: Vec<JobId> = Vec::new();
        for path in inputs.iter().flat_map(|g| g.paths.iter()) {
            if let Some(dep) = self.visit(run, path, Some(&label))? {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }
        run.stack.pop();

        let job = self.build_job(rule, bindings, inputs, deps, &run.jobs)?;
        let id = job.id;
        debug!(
            "Job {} -> {} ({})",
            job.label(),
            job.output.display(),
            job.reason
                .as_ref()
                .map_or_else(|| "up to date".to_string(), |r| r.to_string())
        );

        run.jobs.push(job);
        run.memo.insert(key, id);
        Ok(Some(id))
    }

    fn build_job(
        &self,
        rule: &RuleTemplate,
        bindings: Bindings,
        inputs: Vec<InputGroup>,
        deps: Vec<JobId>,
        jobs: &[Job],
    ) -> Result<Job, ResolveError> {
        let output = rule
            .output
            .substitute(&bindings)
            .map_err(|source| ResolveError::Pattern {
                rule: rule.name.clone(),
                source,
            })?;

        let command = rule
            .command
            .render(&RenderContext {
                inputs: &inputs,
                output: &output,
                threads: rule.threads,
                wildcards: &bindings,
                params: &rule.params,
            })
            .map_err(|placeholder| ResolveError::Template {
                rule: rule.name.clone(),
                placeholder,
            })?;

        let workdir = match rule.workdir {
            WorkDir::Inherit => None,
            WorkDir::Output => Some(output.clone()),
        };

        let reason = self.freshness(rule, &output, &inputs, &deps, jobs);

        Ok(Job {
            id: jobs.len(),
            rule: rule.name.clone(),
            bindings,
            inputs,
            output,
            command,
            threads: rule.threads,
            workdir,
            output_is_dir: rule.directory_output,
            deps,
            reason,
        })
    }

    /// Decides whether a job must run.
    fn freshness(
        &self,
        rule: &RuleTemplate,
        output: &Path,
        inputs: &[InputGroup],
        deps: &[JobId],
        jobs: &[Job],
    ) -> Option<RunReason> {
        if self.force_all || self.forced_rules.contains(&rule.name) {
            return Some(RunReason::Forced);
        }

        if !self.storage.exists(output) {
            return Some(RunReason::MissingOutput);
        }

        if self.incomplete.contains(&normalize_path(output)) {
            return Some(RunReason::Incomplete);
        }

        if let Some(upstream) = deps
            .iter()
            .filter_map(|&d| jobs.get(d))
            .find(|j| j.needs_run())
        {
            return Some(RunReason::UpstreamRerun(upstream.label()));
        }

        let output_time = self.storage.modified(output)?;
        inputs
            .iter()
            .flat_map(|g| g.paths.iter())
            .find(|path| {
                self.storage
                    .modified(path)
                    .map_or(false, |input_time| input_time > output_time)
            })
            .map(|path| RunReason::UpdatedInput(path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{CommandTemplate, InputHook, InputSpec};
    use crate::workflow::storage::memory::MemoryStorage;
    use crate::workflow::wildcards::Pattern;
    use std::sync::Arc;

    const STAGES: [&str; 4] = ["tile_images", "combine_jpeg_dir", "make_tf_record", "predict"];

    fn pipeline() -> RuleRegistry {
        let hook: InputHook = Arc::new(|b: &Bindings| {
            vec![PathBuf::from(format!("in/{}/metadata.a.json", b["dataset"]))]
        });
        let combine = RuleTemplate::new(
            "combine_jpeg_dir",
            Pattern::parse("sorted/{dataset}").unwrap(),
            CommandTemplate::parse("sort --src={input.tiles} --json={input.metadata}").unwrap(),
        )
        .with_named_input(
            "tiles",
            InputSpec::Pattern(Pattern::parse("tiles/{dataset}").unwrap()),
        )
        .with_named_input(
            "metadata",
            InputSpec::Dynamic {
                label: "metadata".to_string(),
                hook,
            },
        )
        .with_workdir(WorkDir::Output);

        RuleRegistry::from_rules(vec![
            RuleTemplate::parse("tile_images", &["in/{dataset}"], "tiles/{dataset}", "tile {input} {output}")
                .unwrap()
                .with_threads(4),
            combine,
            RuleTemplate::parse("make_tf_record", &["sorted/{dataset}"], "records/{dataset}", "rec {input} {output}")
                .unwrap(),
            RuleTemplate::parse("predict", &["records/{dataset}"], "out/{dataset}", "pred {input} {output}")
                .unwrap(),
        ])
        .unwrap()
    }

    fn raw_inputs() -> MemoryStorage {
        MemoryStorage::new()
            .with("in/ds1", 1)
            .with("in/ds1/metadata.a.json", 1)
            .with("in/ds2", 1)
            .with("in/ds2/metadata.a.json", 1)
    }

    fn completed(storage: MemoryStorage, dataset: &str) -> MemoryStorage {
        storage
            .with(format!("tiles/{}", dataset), 2)
            .with(format!("sorted/{}", dataset), 3)
            .with(format!("records/{}", dataset), 4)
            .with(format!("out/{}", dataset), 5)
    }

    fn reasons(graph: &JobGraph) -> Vec<(String, Option<RunReason>)> {
        graph
            .jobs()
            .iter()
            .map(|j| (j.rule.clone(), j.reason.clone()))
            .collect()
    }

    fn targets(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("out/{}", n))).collect()
    }

    #[test]
    fn test_fresh_run_orders_chain() {
        let registry = pipeline();
        let storage = raw_inputs();
        let graph = Resolver::new(&registry, &storage)
            .resolve(Path::new("out/ds1"))
            .unwrap();

        let rules: Vec<_> = graph.jobs().iter().map(|j| j.rule.as_str()).collect();
        assert_eq!(rules, STAGES);
        for (i, job) in graph.jobs().iter().enumerate() {
            assert_eq!(job.id, i);
            if i > 0 {
                assert_eq!(job.deps, vec![i - 1]);
            }
            assert_eq!(job.reason, Some(RunReason::MissingOutput));
        }
        assert_eq!(graph.pending_count(), 4);
    }

    #[test]
    fn test_job_fields() {
        let registry = pipeline();
        let storage = raw_inputs();
        let graph = Resolver::new(&registry, &storage)
            .resolve(Path::new("out/ds1"))
            .unwrap();

        let tile = &graph.jobs()[0];
        assert_eq!(tile.command, "tile in/ds1 tiles/ds1");
        assert_eq!(tile.threads, 4);
        assert_eq!(tile.workdir, None);

        let combine = &graph.jobs()[1];
        assert_eq!(
            combine.command,
            "sort --src=tiles/ds1 --json=in/ds1/metadata.a.json"
        );
        assert_eq!(combine.workdir, Some(PathBuf::from("sorted/ds1")));
        assert_eq!(combine.input_paths().count(), 2);
    }

    #[test]
    fn test_two_datasets_eight_jobs() {
        let registry = pipeline();
        let storage = raw_inputs();
        let graph = Resolver::new(&registry, &storage)
            .resolve_all(&targets(&["ds1", "ds2"]))
            .unwrap();

        assert_eq!(graph.len(), 8);
        assert_eq!(graph.pending_count(), 8);

        for dataset in ["ds1", "ds2"] {
            let ids: Vec<JobId> = STAGES
                .iter()
                .map(|stage| {
                    graph
                        .jobs()
                        .iter()
                        .find(|j| j.rule == *stage && j.bindings["dataset"] == dataset)
                        .unwrap()
                        .id
                })
                .collect();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }

        // The chains share no edges.
        for job in graph.jobs() {
            for dep in &job.deps {
                assert_eq!(graph.jobs()[*dep].bindings, job.bindings);
            }
        }
    }

    #[test]
    fn test_every_dependency_precedes_dependent() {
        let registry = pipeline();
        let storage = raw_inputs();
        let graph = Resolver::new(&registry, &storage)
            .resolve_all(&targets(&["ds2", "ds1"]))
            .unwrap();
        for job in graph.jobs() {
            assert!(job.deps.iter().all(|d| *d < job.id));
        }
    }

    #[test]
    fn test_distinct_bindings_distinct_jobs() {
        let registry = pipeline();
        let storage = raw_inputs();
        let graph = Resolver::new(&registry, &storage)
            .resolve_all(&targets(&["ds1", "ds2", "ds1"]))
            .unwrap();

        let tiles: Vec<&Job> = graph
            .jobs()
            .iter()
            .filter(|j| j.rule == "tile_images")
            .collect();
        assert_eq!(tiles.len(), 2);
        assert_ne!(tiles[0].bindings, tiles[1].bindings);
        assert_ne!(tiles[0].output, tiles[1].output);
        assert_eq!(graph.len(), 8);
    }

    #[test]
    fn test_idempotent_after_complete_run() {
        let registry = pipeline();
        let storage = completed(completed(raw_inputs(), "ds1"), "ds2");
        let graph = Resolver::new(&registry, &storage)
            .resolve_all(&targets(&["ds1", "ds2"]))
            .unwrap();

        assert_eq!(graph.len(), 8);
        assert_eq!(graph.pending_count(), 0);
    }

    #[test]
    fn test_touched_output_invalidates_only_downstream() {
        let registry = pipeline();
        let mut storage = completed(completed(raw_inputs(), "ds1"), "ds2");
        storage.touch("tiles/ds1", 10);

        let graph = Resolver::new(&registry, &storage)
            .resolve_all(&targets(&["ds1", "ds2"]))
            .unwrap();

        let running: Vec<String> = graph.pending().map(|j| j.label()).collect();
        assert_eq!(
            running,
            vec![
                "combine_jpeg_dir[dataset=ds1]",
                "make_tf_record[dataset=ds1]",
                "predict[dataset=ds1]",
            ]
        );
        let ds1 = reasons(&graph);
        assert_eq!(ds1[0].1, None);
        assert_eq!(
            ds1[1].1,
            Some(RunReason::UpdatedInput(PathBuf::from("tiles/ds1")))
        );
        assert_eq!(
            ds1[2].1,
            Some(RunReason::UpstreamRerun(
                "combine_jpeg_dir[dataset=ds1]".to_string()
            ))
        );
    }

    #[test]
    fn test_partial_rerun_skips_fresh_tiling() {
        let registry = pipeline();
        let storage = raw_inputs().with("tiles/ds1", 2);

        let graph = Resolver::new(&registry, &storage)
            .resolve(Path::new("out/ds1"))
            .unwrap();

        assert_eq!(
            reasons(&graph),
            vec![
                ("tile_images".to_string(), None),
                ("combine_jpeg_dir".to_string(), Some(RunReason::MissingOutput)),
                ("make_tf_record".to_string(), Some(RunReason::MissingOutput)),
                ("predict".to_string(), Some(RunReason::MissingOutput)),
            ]
        );
    }

    #[test]
    fn test_stale_tiling_output() {
        let registry = pipeline();
        let mut storage = raw_inputs().with("tiles/ds1", 2);
        storage.touch("in/ds1", 7);

        let graph = Resolver::new(&registry, &storage)
            .resolve(Path::new("out/ds1"))
            .unwrap();
        assert_eq!(
            graph.jobs()[0].reason,
            Some(RunReason::UpdatedInput(PathBuf::from("in/ds1")))
        );
    }

    #[test]
    fn test_equal_mtime_is_fresh() {
        let registry = pipeline();
        let storage = raw_inputs()
            .with("tiles/ds1", 1)
            .with("sorted/ds1", 1)
            .with("records/ds1", 1)
            .with("out/ds1", 1);
        let graph = Resolver::new(&registry, &storage)
            .resolve(Path::new("out/ds1"))
            .unwrap();
        assert_eq!(graph.pending_count(), 0);
    }

    #[test]
    fn test_force_rule_reruns_downstream() {
        let registry = pipeline();
        let storage = completed(raw_inputs(), "ds1");
        let graph = Resolver::new(&registry, &storage)
            .force_rule("combine_jpeg_dir")
            .resolve(Path::new("out/ds1"))
            .unwrap();

        let r = reasons(&graph);
        assert_eq!(r[0].1, None);
        assert_eq!(r[1].1, Some(RunReason::Forced));
        assert!(matches!(r[2].1, Some(RunReason::UpstreamRerun(_))));
        assert!(matches!(r[3].1, Some(RunReason::UpstreamRerun(_))));
    }

    #[test]
    fn test_force_all() {
        let registry = pipeline();
        let storage = completed(raw_inputs(), "ds1");
        let graph = Resolver::new(&registry, &storage)
            .force_all(true)
            .resolve(Path::new("out/ds1"))
            .unwrap();
        assert!(graph
            .jobs()
            .iter()
            .all(|j| j.reason == Some(RunReason::Forced)));
    }

    #[test]
    fn test_incomplete_output_is_stale() {
        let registry = pipeline();
        let storage = completed(raw_inputs(), "ds1");
        let graph = Resolver::new(&registry, &storage)
            .with_incomplete(vec![PathBuf::from("./records/ds1")])
            .resolve(Path::new("out/ds1"))
            .unwrap();

        let r = reasons(&graph);
        assert_eq!(r[1].1, None);
        assert_eq!(r[2].1, Some(RunReason::Incomplete));
        assert!(matches!(r[3].1, Some(RunReason::UpstreamRerun(_))));
    }

    #[test]
    fn test_existing_leaf_target_needs_no_jobs() {
        let registry = pipeline();
        let storage = raw_inputs();
        let graph = Resolver::new(&registry, &storage)
            .resolve(Path::new("in/ds1"))
            .unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_missing_input_is_unresolvable() {
        let registry = pipeline();
        let storage = MemoryStorage::new().with("in/ds1/metadata.a.json", 1);
        let err = Resolver::new(&registry, &storage)
            .resolve(Path::new("out/ds1"))
            .unwrap_err();
        match err {
            ResolveError::UnresolvableTarget {
                target,
                required_by,
            } => {
                assert_eq!(target, PathBuf::from("in/ds1"));
                assert_eq!(required_by.as_deref(), Some("tile_images[dataset=ds1]"));
            }
            other => panic!("Expected UnresolvableTarget, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_target_is_unresolvable() {
        let registry = pipeline();
        let storage = raw_inputs();
        let err = Resolver::new(&registry, &storage)
            .resolve(Path::new("elsewhere/thing"))
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UnresolvableTarget {
                required_by: None,
                ..
            }
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let registry = RuleRegistry::from_rules(vec![
            RuleTemplate::parse("a", &["b/{x}"], "a/{x}", "cp {input} {output}").unwrap(),
            RuleTemplate::parse("b", &["a/{x}"], "b/{x}", "cp {input} {output}").unwrap(),
        ])
        .unwrap();
        let storage = MemoryStorage::new();

        let err = Resolver::new(&registry, &storage)
            .resolve(Path::new("a/1"))
            .unwrap_err();
        match err {
            ResolveError::DependencyCycle { chain } => assert_eq!(
                chain,
                vec![
                    PathBuf::from("a/1"),
                    PathBuf::from("b/1"),
                    PathBuf::from("a/1")
                ]
            ),
            other => panic!("Expected DependencyCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_cycle_detected() {
        let registry = RuleRegistry::from_rules(vec![RuleTemplate::parse(
            "loop",
            &["x/{n}"],
            "x/{n}",
            "touch {output}",
        )
        .unwrap()])
        .unwrap();
        let storage = MemoryStorage::new().with("x/1", 1);
        let err = Resolver::new(&registry, &storage)
            .resolve(Path::new("x/1"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::DependencyCycle { .. }));
    }

    #[test]
    fn test_ambiguous_rule() {
        let registry = RuleRegistry::from_rules(vec![
            RuleTemplate::parse("one", &["in/{x}"], "out/{x}", "cp {input} {output}").unwrap(),
            RuleTemplate::parse("two", &["src/{y}"], "out/{y}", "cp {input} {output}").unwrap(),
        ])
        .unwrap();
        let storage = MemoryStorage::new().with("in/1", 1).with("src/1", 1);
        let err = Resolver::new(&registry, &storage)
            .resolve(Path::new("out/1"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousRule { .. }));
    }
}
