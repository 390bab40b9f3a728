//! Execution Timeline
//!
//! Records when each job starts and finishes so a run can be rendered
//! as an ASCII Gantt chart.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Width of the job label column in the chart.
const LABEL_WIDTH: usize = 32;

/// Width of the bar area in the chart.
const CHART_WIDTH: usize = 50;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
    /// Never started because an upstream job failed
    Blocked,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Label of the job, e.g. `predict[dataset=ds1]`
    pub job: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// One job's span on the timeline, in milliseconds from the start.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    start: u128,
    end: Option<u128>,
    failed: bool,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a job.
    pub fn add_event(&mut self, job: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            job: job.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn offset(&self, at: Instant) -> u128 {
        at.duration_since(self.start_time).as_millis()
    }

    /// Spans in order of first start.
    fn spans(&self) -> Vec<(String, Span)> {
        let mut spans: Vec<(String, Span)> = Vec::new();

        for event in &self.events {
            let at = self.offset(event.timestamp);
            match event.event_type {
                EventType::Started => spans.push((
                    event.job.clone(),
                    Span {
                        start: at,
                        end: None,
                        failed: false,
                    },
                )),
                EventType::Completed | EventType::Failed => {
                    if let Some((_, span)) = spans
                        .iter_mut()
                        .rev()
                        .find(|(job, span)| *job == event.job && span.end.is_none())
                    {
                        span.end = Some(at);
                        span.failed = event.event_type == EventType::Failed;
                    }
                }
                EventType::Blocked => {}
            }
        }

        spans
    }

    /// Renders an ASCII Gantt chart.
    ///
    /// Completed jobs are drawn with `#`, failed jobs with `X`, and
    /// blocked jobs are listed underneath.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.offset(Instant::now());
        if total_time == 0 {
            return output;
        }
        let scale = CHART_WIDTH as f64 / total_time as f64;

        for (job, span) in self.spans() {
            let Some(end) = span.end else { continue };
            let start_pos = (span.start as f64 * scale) as usize;
            let width = ((end.saturating_sub(span.start)) as f64 * scale).max(1.0) as usize;
            let mark = if span.failed { "X" } else { "#" };

            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                fit(&job, LABEL_WIDTH),
                " ".repeat(start_pos),
                mark.repeat(width),
                end - span.start
            ));
        }

        let blocked: Vec<&str> = self
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Blocked)
            .map(|e| e.job.as_str())
            .collect();
        if !blocked.is_empty() {
            output.push_str(&format!("\nBlocked: {}\n", blocked.join(", ")));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns finished job durations in milliseconds.
    pub fn get_durations(&self) -> BTreeMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(job, span)| span.end.map(|end| (job, end - span.start)))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or shortens a label to exactly `width` characters.
fn fit(s: &str, width: usize) -> String {
    let count = s.chars().count();
    if count <= width {
        format!("{:width$}", s, width = width)
    } else {
        let head: String = s.chars().take(width - 3).collect();
        format!("{}...", head)
    }
}
