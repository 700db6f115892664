//! Game-engine subsystem scheduler.
//!
//! Long-lived [`Worker`]s (physics, rendering, audio, terrain generation) are ticked at a target
//! frequency by a [`WorkerScheduler`], which places each one in the main-thread, dedicated-thread
//! or shared-pool domain according to its [`ThreadAffinity`]. Inside a domain, the worker with the
//! largest priority-weighted overdue time goes first. Short-lived [`Task`]s (streaming a terrain
//! chunk, a one-off asset load) go to a separate [`TaskRunner`].

pub mod config;
pub mod error;
pub mod logging;
pub mod priority;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod threading;
pub mod timing;
pub mod worker;

pub use config::{SchedulerConfig, TaskRunnerConfig};
pub use error::{RegistrationError, SchedulerError, TickError, TickFailure, TickResult};
pub use priority::{PriorityLevel, PriorityTable};
pub use scheduler::WorkerScheduler;
pub use stats::{TaskRunnerStats, WorkerStats};
pub use task::{task_score, Task, TaskHandle, TaskRunner};
pub use timing::{Horizon, TimingSnapshot, TimingTracker, LONG_HORIZON, SHORT_HORIZON};
pub use worker::{ThreadAffinity, Worker, WorkerHandle, WorkerId};
