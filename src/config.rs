//! Scheduler and task runner configuration.
//!
//! Both structs deserialize from partial documents: any field left out takes its default.

use serde::{Deserialize, Serialize};
use std::thread;

fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Tuning knobs for [`WorkerScheduler`](crate::WorkerScheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Threads in the shared pool. Zero forbids pool registrations.
    pub pool_threads: usize,
    /// Cores pool threads are pinned to, assigned round-robin. Empty leaves them unpinned.
    pub pool_cores: Vec<usize>,
    /// Prefix for every thread the scheduler spawns.
    pub thread_name_prefix: String,
    /// Raise dedicated threads' OS priority according to their worker's level.
    pub elevate_dedicated_threads: bool,
    /// Long-horizon average interval above `factor × min_interval` flags starvation risk.
    pub starvation_factor: f64,
    /// Long-horizon samples required before starvation can be flagged.
    pub starvation_min_samples: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // Leave one core to the main thread.
            pool_threads: default_parallelism().saturating_sub(1).max(1),
            pool_cores: Vec::new(),
            thread_name_prefix: "sched".to_string(),
            elevate_dedicated_threads: false,
            starvation_factor: 4.0,
            starvation_min_samples: 20,
        }
    }
}

impl SchedulerConfig {
    /// Config with an explicit pool size and defaults elsewhere.
    pub fn with_pool_threads(pool_threads: usize) -> Self {
        Self {
            pool_threads,
            ..Self::default()
        }
    }
}

/// Tuning knobs for [`TaskRunner`](crate::TaskRunner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRunnerConfig {
    /// Runner threads draining the task queue. Clamped to at least one on start.
    pub threads: usize,
    pub thread_name_prefix: String,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            threads: (default_parallelism() / 2).max(1),
            thread_name_prefix: "task".to_string(),
        }
    }
}

impl TaskRunnerConfig {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }
}
