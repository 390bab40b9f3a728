//! Resource Usage Monitoring
//!
//! Samples CPU and memory of the engine process while jobs run. A
//! sampler can run on its own thread via [`ResourceMonitor::spawn`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: Instant,
    /// CPU usage percentage (0-100 per core)
    pub cpu_usage: f32,
    pub memory_mb: u64,
}

/// Monitors resource usage of the current process.
pub struct ResourceMonitor {
    system: System,
    process_id: Option<Pid>,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let process_id = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Resource monitoring disabled: {}", e);
                None
            }
        };

        Self {
            system: System::new(),
            process_id,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a sample.
    ///
    /// The first call only primes the CPU counters. Later calls closer
    /// together than `min_interval` are ignored.
    pub fn sample(&mut self) {
        let Some(pid) = self.process_id else { return };
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        if let Some(process) = self.system.process(pid) {
            self.samples.push(ResourceSample {
                timestamp: now,
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
            });
        }
    }

    /// Starts sampling on a background thread every `interval`.
    pub fn spawn(interval: Duration) -> MonitorHandle {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::spawn(move || {
            let mut monitor = ResourceMonitor::new().with_min_interval(interval);
            while flag.load(Ordering::Relaxed) {
                monitor.sample();
                thread::sleep(interval);
            }
            monitor
        });

        MonitorHandle { running, handle }
    }

    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        let min_memory = self.samples.iter().map(|s| s.memory_mb).min().unwrap_or(0);

        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Min Memory: {} MB\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_mb(),
            min_memory,
            self.samples.len()
        )
    }

    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// A sampler running on a background thread.
pub struct MonitorHandle {
    running: Arc<AtomicBool>,
    handle: JoinHandle<ResourceMonitor>,
}

impl MonitorHandle {
    /// Stops the sampler and returns what it collected.
    ///
    /// Returns `None` if the sampling thread panicked.
    pub fn stop(self) -> Option<ResourceMonitor> {
        self.running.store(false, Ordering::Relaxed);
        match self.handle.join() {
            Ok(monitor) => {
                debug!("Resource monitor stopped after {} samples", monitor.samples.len());
                Some(monitor)
            }
            Err(_) => {
                warn!("Resource monitor thread panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_is_warmup() {
        let mut monitor = ResourceMonitor::new();
        monitor.sample();
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(300));
        monitor.sample();
        assert_eq!(monitor.get_samples().len(), 1);
    }

    #[test]
    fn test_min_interval_skips_close_samples() {
        let mut monitor = ResourceMonitor::new().with_min_interval(Duration::from_millis(200));
        monitor.sample();
        monitor.sample();
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(250));
        monitor.sample();
        assert!(!monitor.get_samples().is_empty());
    }

    #[test]
    fn test_summary() {
        let empty = ResourceMonitor::default();
        assert_eq!(empty.get_summary(), "No resource data collected");
        assert_eq!(empty.peak_memory_mb(), 0);
        assert_eq!(empty.average_cpu(), 0.0);

        let mut monitor = ResourceMonitor::new();
        monitor.sample();
        thread::sleep(Duration::from_millis(300));
        monitor.sample();

        let summary = monitor.get_summary();
        assert!(summary.contains("Average CPU"));
        assert!(summary.contains("Peak Memory"));
        assert!(summary.contains("Samples: 1"));
    }

    #[test]
    fn test_spawned_monitor_collects_samples() {
        let handle = ResourceMonitor::spawn(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(400));

        let monitor = handle.stop().unwrap();
        assert!(!monitor.get_samples().is_empty());
        assert!(monitor.average_cpu() >= 0.0);
    }
}
