//! Execution Planner
//!
//! Tracks the scheduling state of a resolved job graph:
//! - Dependency tracking
//! - Parallel job and thread limits
//! - Blocking the dependents of failed jobs
//! - Per-job metrics

use std::time::Instant;

use log::{debug, info};

use super::model::{Job, JobGraph, JobId};

/// Status of a job during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Waiting for dependencies or a free slot
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Output already up to date; never run
    Satisfied,
    /// Failed with error message
    Failed(String),
    /// An upstream job failed; will never run
    Blocked,
    /// Not started because the run stopped early
    Cancelled,
}

impl JobStatus {
    /// True once the job will not change state again.
    pub fn is_final(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// True if dependents may consume the job's output.
    pub fn is_done(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Satisfied)
    }
}

/// Execution metrics for a single job.
#[derive(Debug, Clone)]
pub struct JobMetrics {
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    /// Duration in milliseconds
    pub duration_ms: Option<u128>,
    pub status: JobStatus,
}

impl JobMetrics {
    fn new(status: JobStatus) -> Self {
        Self {
            start_time: None,
            end_time: None,
            duration_ms: None,
            status,
        }
    }

    fn finish(&mut self, status: JobStatus) {
        let now = Instant::now();
        self.end_time = Some(now);
        if let Some(start) = self.start_time {
            self.duration_ms = Some(now.duration_since(start).as_millis());
        }
        self.status = status;
    }
}

/// Decides which jobs may start and records their progress.
///
/// Jobs whose output is already up to date start out `Satisfied` and
/// count as done for their dependents.
pub struct ExecutionPlanner {
    graph: JobGraph,
    metrics: Vec<JobMetrics>,
    max_parallel_jobs: usize,
    current_threads_used: usize,
    max_system_threads: usize,
}

impl ExecutionPlanner {
    pub fn new(graph: JobGraph, max_parallel_jobs: usize) -> Self {
        let max_system_threads = num_cpus::get().max(1);

        info!(
            "Creating planner: {} job(s), {} max parallel, {} system threads",
            graph.len(),
            max_parallel_jobs,
            max_system_threads
        );

        let metrics = graph
            .jobs()
            .iter()
            .map(|job| {
                JobMetrics::new(if job.needs_run() {
                    JobStatus::Pending
                } else {
                    JobStatus::Satisfied
                })
            })
            .collect();

        Self {
            graph,
            metrics,
            max_parallel_jobs: max_parallel_jobs.max(1),
            current_threads_used: 0,
            max_system_threads,
        }
    }

    /// Overrides the detected core count.
    pub fn with_system_threads(mut self, threads: usize) -> Self {
        self.max_system_threads = threads.max(1);
        self
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.graph.get(id)
    }

    /// Threads a job is charged. Requests above the core count are
    /// clamped so the job can still run on its own.
    pub fn effective_threads(&self, job: &Job) -> usize {
        job.threads.clamp(1, self.max_system_threads)
    }

    /// Returns jobs that may start now, in graph order.
    ///
    /// A job is ready if it is pending, all its dependencies are done,
    /// and starting it stays within the job and thread limits.
    pub fn get_ready_jobs(&self) -> Vec<JobId> {
        let mut ready = Vec::new();
        let mut threads_to_allocate = 0;
        let running = self.running_count();

        for job in self.graph.jobs() {
            if self.metrics[job.id].status != JobStatus::Pending {
                continue;
            }

            let deps_done = job
                .deps
                .iter()
                .all(|dep| self.metrics[*dep].status.is_done());
            if !deps_done {
                continue;
            }

            if running + ready.len() >= self.max_parallel_jobs {
                break;
            }

            let threads = self.effective_threads(job);
            if self.current_threads_used + threads_to_allocate + threads > self.max_system_threads {
                debug!(
                    "Job {} needs {} threads but only {} available",
                    job.label(),
                    threads,
                    self.max_system_threads
                        .saturating_sub(self.current_threads_used + threads_to_allocate)
                );
                continue;
            }

            ready.push(job.id);
            threads_to_allocate += threads;
        }

        ready
    }

    pub fn mark_job_running(&mut self, id: JobId) {
        let Some(job) = self.graph.get(id) else {
            return;
        };
        let threads = self.effective_threads(job);
        self.current_threads_used += threads;
        debug!(
            "Job {} started using {} threads (total: {}/{})",
            job.label(),
            threads,
            self.current_threads_used,
            self.max_system_threads
        );

        let metrics = &mut self.metrics[id];
        metrics.start_time = Some(Instant::now());
        metrics.status = JobStatus::Running;
    }

    pub fn mark_job_completed(&mut self, id: JobId) {
        self.release(id);
        if let Some(metrics) = self.metrics.get_mut(id) {
            metrics.finish(JobStatus::Completed);
        }
    }

    /// Marks a job failed and blocks everything downstream of it.
    /// Returns the newly blocked jobs.
    pub fn mark_job_failed(&mut self, id: JobId, error: String) -> Vec<JobId> {
        self.release(id);
        if let Some(metrics) = self.metrics.get_mut(id) {
            metrics.finish(JobStatus::Failed(error));
        }

        let mut blocked = Vec::new();
        for dependent in self.graph.transitive_dependents(id) {
            let metrics = &mut self.metrics[dependent];
            if metrics.status == JobStatus::Pending {
                metrics.status = JobStatus::Blocked;
                blocked.push(dependent);
            }
        }
        blocked
    }

    /// Cancels every job that has not started. Returns how many.
    pub fn cancel_pending(&mut self) -> usize {
        let mut cancelled = 0;
        for metrics in &mut self.metrics {
            if metrics.status == JobStatus::Pending {
                metrics.status = JobStatus::Cancelled;
                cancelled += 1;
            }
        }
        cancelled
    }

    fn release(&mut self, id: JobId) {
        if let Some(job) = self.graph.get(id) {
            let threads = self.effective_threads(job);
            self.current_threads_used = self.current_threads_used.saturating_sub(threads);
            debug!(
                "Job {} finished, released {} threads (total: {}/{})",
                job.label(),
                threads,
                self.current_threads_used,
                self.max_system_threads
            );
        }
    }

    /// Returns true while any job is pending or running.
    pub fn has_work_remaining(&self) -> bool {
        self.metrics.iter().any(|m| !m.status.is_final())
    }

    pub fn running_count(&self) -> usize {
        self.count(|s| *s == JobStatus::Running)
    }

    /// Number of jobs whose status satisfies `pred`.
    pub fn count(&self, pred: impl Fn(&JobStatus) -> bool) -> usize {
        self.metrics.iter().filter(|m| pred(&m.status)).count()
    }

    /// Returns the current progress as (finished, total).
    pub fn progress(&self) -> (usize, usize) {
        (self.count(JobStatus::is_final), self.metrics.len())
    }

    pub fn status(&self, id: JobId) -> Option<&JobStatus> {
        self.metrics.get(id).map(|m| &m.status)
    }

    /// Metrics indexed by job id.
    pub fn get_metrics(&self) -> &[JobMetrics] {
        &self.metrics
    }
}
