//! Job Execution Engine
//!
//! Runs a resolved [`JobGraph`]:
//! - Parallel scheduling in dependency order
//! - Skipping jobs whose outputs are up to date
//! - Blocking everything downstream of a failed job
//! - Journal updates after every job start and finish
//! - Resource monitoring and an execution timeline

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{EngineError, JobExecutionError, StateError};
use crate::monitoring::{EventType, ExecutionTimeline, ResourceMonitor};
use crate::workflow::planner::JobStatus;
use crate::workflow::{ExecutionPlanner, JobGraph, JobId, RunJournal};

use super::job::execute_job;

/// Interval for resource monitoring samples.
const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

type Completion = (JobId, Result<(), JobExecutionError>);

/// Outcome of an engine run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Jobs that needed to run when the run started
    pub planned: usize,
    /// Jobs that ran and succeeded
    pub executed: usize,
    /// Jobs skipped because their output was up to date
    pub satisfied: usize,
    pub failures: Vec<JobExecutionError>,
    /// Jobs not run because an upstream job failed
    pub blocked: usize,
    /// Jobs not run because the run stopped early
    pub cancelled: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.blocked == 0 && self.cancelled == 0
    }

    /// Converts job failures into an error.
    pub fn into_result(self) -> Result<RunSummary, EngineError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(EngineError::JobsFailed {
                blocked: self.blocked + self.cancelled,
                failures: self.failures,
            })
        }
    }
}

/// Executes a job graph.
///
/// # Example
///
/// ```rust,no_run
/// use std::path::PathBuf;
/// use slidegraph::execution::Engine;
/// use slidegraph::workflow::{LocalStorage, Resolver, RuleRegistry, RuleTemplate};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut registry = RuleRegistry::new();
///     registry.add_rule(RuleTemplate::parse(
///         "copy",
///         &["/data/in/{name}.txt"],
///         "/data/out/{name}.txt",
///         "cp {input} {output}",
///     )?)?;
///
///     let graph = Resolver::new(&registry, &LocalStorage)
///         .resolve(&PathBuf::from("/data/out/a.txt"))?;
///
///     let mut engine = Engine::new(graph);
///     engine.set_max_parallel(4);
///     engine.run()?.into_result()?;
///     Ok(())
/// }
/// ```
pub struct Engine {
    graph: JobGraph,
    max_parallel: usize,
    dry_run: bool,
    fail_fast: bool,
    working_dir: Option<PathBuf>,
    journal: Option<RunJournal>,
    show_timeline: bool,
    system_threads: Option<usize>,
}

impl Engine {
    pub fn new(graph: JobGraph) -> Self {
        Self {
            graph,
            max_parallel: 4,
            dry_run: false,
            fail_fast: false,
            working_dir: None,
            journal: None,
            show_timeline: false,
            system_threads: None,
        }
    }

    /// Sets the maximum number of jobs running at once.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    /// In dry run mode jobs are listed, not run.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Stop launching jobs after the first failure.
    pub fn set_fail_fast(&mut self, fail_fast: bool) {
        self.fail_fast = fail_fast;
    }

    /// Directory relative job paths are resolved against.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    /// Journal to update as jobs start and finish.
    pub fn set_journal(&mut self, journal: RunJournal) {
        self.journal = Some(journal);
    }

    pub fn set_show_timeline(&mut self, show: bool) {
        self.show_timeline = show;
    }

    /// Overrides the detected core count used for thread accounting.
    pub fn set_system_threads(&mut self, threads: usize) {
        self.system_threads = Some(threads);
    }

    pub fn journal(&self) -> Option<&RunJournal> {
        self.journal.as_ref()
    }

    /// Runs every job that is not up to date.
    ///
    /// Job failures do not make this return `Err`; they are collected in
    /// the [`RunSummary`]. `Err` means the engine itself could not go on.
    pub fn run(&mut self) -> Result<RunSummary, EngineError> {
        let start_time = Instant::now();
        let planned = self.graph.pending_count();
        let satisfied = self.graph.len() - planned;

        if self.dry_run {
            self.print_dry_run();
            return Ok(RunSummary {
                planned,
                satisfied,
                elapsed: start_time.elapsed(),
                ..RunSummary::default()
            });
        }

        if planned == 0 {
            info!("Nothing to be done: all {} job(s) up to date", satisfied);
            return Ok(RunSummary {
                satisfied,
                elapsed: start_time.elapsed(),
                ..RunSummary::default()
            });
        }

        info!(
            "Running {} of {} job(s) for {} target(s) (max parallel: {}, fail fast: {})",
            planned,
            self.graph.len(),
            self.graph.targets().len(),
            self.max_parallel,
            self.fail_fast
        );

        let mut planner = ExecutionPlanner::new(self.graph.clone(), self.max_parallel);
        if let Some(threads) = self.system_threads {
            planner = planner.with_system_threads(threads);
        }
        let mut timeline = ExecutionTimeline::new();
        let mut failures = Vec::new();

        let monitor = ResourceMonitor::spawn(MONITOR_SAMPLE_INTERVAL);
        let outcome = self.schedule(&mut planner, &mut timeline, &mut failures);
        let resources = monitor.stop();
        outcome?;

        let summary = RunSummary {
            planned,
            executed: planner.count(|s| *s == JobStatus::Completed),
            satisfied: planner.count(|s| *s == JobStatus::Satisfied),
            failures,
            blocked: planner.count(|s| *s == JobStatus::Blocked),
            cancelled: planner.count(|s| *s == JobStatus::Cancelled),
            elapsed: start_time.elapsed(),
        };

        for (job, ms) in timeline.get_durations() {
            debug!("{} took {} ms", job, ms);
        }

        println!();
        println!(
            "Executed {} job(s), {} up to date, {} failed, {} not run in {:.2?}",
            summary.executed,
            summary.satisfied,
            summary.failures.len(),
            summary.blocked + summary.cancelled,
            summary.elapsed
        );
        if let Some(resources) = resources {
            println!();
            println!("{}", resources.get_summary());
        }
        if self.show_timeline {
            println!("{}", timeline.gantt_chart());
        }

        Ok(summary)
    }

    /// Main loop: launch ready jobs, then wait for one to finish.
    ///
    /// A journal write failure stops new launches, but the loop keeps
    /// collecting running jobs before the error is returned.
    fn schedule(
        &mut self,
        planner: &mut ExecutionPlanner,
        timeline: &mut ExecutionTimeline,
        failures: &mut Vec<JobExecutionError>,
    ) -> Result<(), EngineError> {
        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = channel();
        let mut journal_error: Option<StateError> = None;

        loop {
            if journal_error.is_none() {
                for id in planner.get_ready_jobs() {
                    if let Err(e) = self.launch(id, planner, timeline, &tx) {
                        stop_on_journal_error(e, planner, &mut journal_error);
                        break;
                    }
                }
            }

            if planner.running_count() == 0 {
                if journal_error.is_none() && planner.has_work_remaining() {
                    let stuck = planner.cancel_pending();
                    error!("{} job(s) can never become ready; cancelling them", stuck);
                }
                break;
            }

            let (id, result) = rx.recv().map_err(|_| EngineError::ChannelClosed)?;
            let Some(job) = planner.job(id).cloned() else {
                continue;
            };
            let label = job.label();

            match result {
                Ok(()) => {
                    planner.mark_job_completed(id);
                    timeline.add_event(label.clone(), EventType::Completed);
                    if let Some(journal) = self.journal.as_mut() {
                        journal.mark_completed(&job.output);
                        if let Err(e) = journal.save() {
                            stop_on_journal_error(e, planner, &mut journal_error);
                        }
                    }

                    let (done, total) = planner.progress();
                    info!("[{}/{}] Finished {}", done, total, label);
                }
                Err(e) => {
                    let message = e.to_string();
                    error!("{}", message);
                    timeline.add_event(label.clone(), EventType::Failed);

                    for blocked in planner.mark_job_failed(id, message.clone()) {
                        if let Some(dependent) = planner.job(blocked) {
                            warn!("Skipping {}: upstream job {} failed", dependent.label(), label);
                            timeline.add_event(dependent.label(), EventType::Blocked);
                        }
                    }

                    if let Some(journal) = self.journal.as_mut() {
                        journal.mark_failed(&label, &job.output, &message);
                        if let Err(save_err) = journal.save() {
                            stop_on_journal_error(save_err, planner, &mut journal_error);
                        }
                    }
                    failures.push(e);

                    if self.fail_fast {
                        let cancelled = planner.cancel_pending();
                        if cancelled > 0 {
                            warn!(
                                "Fail fast: not starting {} remaining job(s), waiting for {} running",
                                cancelled,
                                planner.running_count()
                            );
                        }
                    }
                }
            }
        }

        match journal_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Starts a job on its own thread.
    ///
    /// The job is journaled before it starts; if that write fails the job
    /// is left pending.
    fn launch(
        &mut self,
        id: JobId,
        planner: &mut ExecutionPlanner,
        timeline: &mut ExecutionTimeline,
        tx: &Sender<Completion>,
    ) -> Result<(), StateError> {
        let Some(job) = planner.job(id).cloned() else {
            return Ok(());
        };
        let label = job.label();

        match &job.reason {
            Some(reason) => info!("Starting {} ({})", label, reason),
            None => info!("Starting {}", label),
        }
        debug!("  command: {}", job.command);

        if let Some(journal) = self.journal.as_mut() {
            journal.mark_started(&job.output);
            journal.save()?;
        }

        timeline.add_event(label, EventType::Started);
        planner.mark_job_running(id);

        let tx = tx.clone();
        let working_dir = self.working_dir.clone();
        thread::spawn(move || {
            let result = execute_job(&job, working_dir.as_deref());
            if let Err(e) = tx.send((job.id, result)) {
                error!("Failed to send completion of {}: {}", job.label(), e);
            }
        });

        Ok(())
    }

    fn print_dry_run(&self) {
        for job in self.graph.pending() {
            println!();
            println!("[DRY RUN] {}", job.label());
            if let Some(reason) = &job.reason {
                println!("  Reason: {}", reason);
            }
            println!("  Command: {}", job.command);
            println!("  Output: {}", job.output.display());
            println!("  Threads: {}", job.threads);
        }
        println!();
        println!(
            "{} job(s) would run, {} up to date",
            self.graph.pending_count(),
            self.graph.len() - self.graph.pending_count()
        );
    }
}

/// Records the first journal failure and cancels every job not yet started.
fn stop_on_journal_error(
    e: StateError,
    planner: &mut ExecutionPlanner,
    journal_error: &mut Option<StateError>,
) {
    error!("{}", e);
    let cancelled = planner.cancel_pending();
    if journal_error.is_none() {
        warn!(
            "Journal unavailable: not starting {} remaining job(s), waiting for {} running",
            cancelled,
            planner.running_count()
        );
        *journal_error = Some(e);
    }
}
