//! Run Monitoring
//!
//! - [`ResourceMonitor`]: CPU and memory of the engine process
//! - [`ExecutionTimeline`]: job start and end times, rendered as a Gantt chart

pub mod resource;
pub mod timeline;

pub use resource::{MonitorHandle, ResourceMonitor, ResourceSample};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
