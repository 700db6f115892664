//! Long-lived periodic workers and the per-worker scheduling state.
//!
//! A subsystem implements [`Worker`] and hands it to the scheduler once. The scheduler wraps it in
//! a [`WorkerSlot`] which carries the mutable adaptive interval, the tick counters and the timing
//! tracker. The registering subsystem keeps a [`WorkerHandle`] to throttle the worker or read its
//! statistics from any thread.

use crate::config::SchedulerConfig;
use crate::error::{TickFailure, TickResult};
use crate::priority::PriorityLevel;
use crate::timing::{TimingSnapshot, TimingTracker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Thread(s) permitted to execute a worker's tick. Chosen exactly once, at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadAffinity {
    /// Ticked from [`WorkerScheduler::pump_main_thread`](crate::WorkerScheduler::pump_main_thread).
    MainOnly,
    /// Ticked by a thread created solely for this worker.
    Dedicated,
    /// Ticked by any thread of the shared pool.
    Pool,
}

impl fmt::Display for ThreadAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ThreadAffinity::MainOnly => "main",
            ThreadAffinity::Dedicated => "dedicated",
            ThreadAffinity::Pool => "pool",
        };
        write!(f, "{label}")
    }
}

/// A recurring, rate-targeted unit of subsystem work.
///
/// `name`, `priority_level`, `target_frequency_hz` and `thread_affinity` are read once at
/// registration and cached; changing what they return afterwards has no effect on scheduling.
pub trait Worker: Send + 'static {
    /// Diagnostic name used in logs and stats.
    fn name(&self) -> &str;

    fn priority_level(&self) -> PriorityLevel;

    /// Desired tick rate. Must be finite and positive.
    fn target_frequency_hz(&self) -> f64;

    /// Affinity used by [`WorkerScheduler::register_worker`](crate::WorkerScheduler::register_worker).
    fn thread_affinity(&self) -> ThreadAffinity {
        ThreadAffinity::Pool
    }

    /// Perform one bounded slice of work. `elapsed` is the time since the previous tick (or since
    /// registration for the first tick). Must not block indefinitely.
    fn tick(&mut self, elapsed: Duration) -> TickResult;
}

/// Identifier assigned at registration, unique within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Convert a frequency into the interval between ticks, in nanoseconds (at least 1).
pub(crate) fn interval_nanos(hz: f64) -> u64 {
    let nanos = (1_000_000_000.0 / hz).round();
    if nanos >= u64::MAX as f64 {
        u64::MAX
    } else {
        (nanos as u64).max(1)
    }
}

/// Thresholds for flagging a worker whose cadence lags far behind its target.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StarvationPolicy {
    pub(crate) factor: f64,
    pub(crate) min_samples: usize,
}

impl StarvationPolicy {
    pub(crate) fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            factor: config.starvation_factor,
            min_samples: config.starvation_min_samples,
        }
    }
}

/// Callback installed by the owning domain; fired after a rate hook changes the interval.
pub(crate) type RateListener = Box<dyn Fn(&WorkerSlot) + Send + Sync>;

/// Worker body plus the state only the ticking thread may touch.
struct WorkerCell {
    worker: Box<dyn Worker>,
    timing: TimingTracker,
}

/// Scheduling state for one registered worker.
///
/// The descriptive fields are fixed at registration. Timing fields follow a single-writer rule:
/// `tick_count`, `last_tick_nanos`, `failures` and the published snapshot are only written by the
/// thread that currently holds the worker (which the dispatcher guarantees is at most one).
pub(crate) struct WorkerSlot {
    id: WorkerId,
    name: String,
    level: PriorityLevel,
    affinity: ThreadAffinity,
    target_hz: f64,
    /// Interval derived from the target frequency, restored by `reset_rate`.
    base_interval_nanos: u64,
    /// Adaptive throttle adjusted by `less_ticks` / `more_ticks`.
    min_interval_nanos: AtomicU64,
    /// Reference point for `last_tick_nanos`.
    epoch: Instant,
    /// Offset of the last tick from `epoch` (0 before the first tick).
    last_tick_nanos: AtomicU64,
    tick_count: AtomicU64,
    failures: AtomicU64,
    starving: AtomicBool,
    published: Mutex<TimingSnapshot>,
    cell: Mutex<WorkerCell>,
    rate_listener: OnceLock<RateListener>,
}

impl WorkerSlot {
    /// Wrap a validated worker. The first interval is measured from `registered_at`.
    pub(crate) fn new(
        id: WorkerId,
        worker: Box<dyn Worker>,
        affinity: ThreadAffinity,
        registered_at: Instant,
    ) -> Self {
        let name = worker.name().to_string();
        let level = worker.priority_level();
        let target_hz = worker.target_frequency_hz();
        let base_interval_nanos = interval_nanos(target_hz);
        Self {
            id,
            name,
            level,
            affinity,
            target_hz,
            base_interval_nanos,
            min_interval_nanos: AtomicU64::new(base_interval_nanos),
            epoch: registered_at,
            last_tick_nanos: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            starving: AtomicBool::new(false),
            published: Mutex::new(TimingSnapshot::default()),
            cell: Mutex::new(WorkerCell {
                worker,
                timing: TimingTracker::new(registered_at),
            }),
            rate_listener: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Install the domain's rate-change callback. Only the first call has an effect.
    pub(crate) fn set_rate_listener(&self, listener: RateListener) {
        let _ = self.rate_listener.set(listener);
    }

    fn rate_changed(&self) {
        if let Some(listener) = self.rate_listener.get() {
            listener(self);
        }
    }

    pub(crate) fn level(&self) -> PriorityLevel {
        self.level
    }

    pub(crate) fn min_interval(&self) -> Duration {
        Duration::from_nanos(self.min_interval_nanos.load(AtomicOrdering::Relaxed))
    }

    pub(crate) fn last_tick(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_tick_nanos.load(AtomicOrdering::Acquire))
    }

    /// Absolute instant the worker becomes due, using the current adaptive interval.
    pub(crate) fn next_due(&self) -> Instant {
        self.last_tick() + self.min_interval()
    }

    /// Signed seconds until due at `now`; negative once overdue.
    pub(crate) fn time_until_due_at(&self, now: Instant) -> f64 {
        let due = self.next_due();
        if due >= now {
            due.duration_since(now).as_secs_f64()
        } else {
            -now.duration_since(due).as_secs_f64()
        }
    }

    /// Tick the worker once and return the instant it is next due.
    ///
    /// Errors and panics escaping the worker are logged with its identity and counted; they never
    /// reach the dispatch thread.
    pub(crate) fn run_tick(&self, policy: StarvationPolicy) -> Instant {
        let mut cell = self.cell.lock();
        let WorkerCell { worker, timing } = &mut *cell;

        let now = Instant::now();
        let elapsed = timing.record_tick(now);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.tick(elapsed)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(TickFailure::Error(err)),
            Err(payload) => Some(TickFailure::from_panic(payload)),
        };
        if let Some(failure) = failure {
            self.failures.fetch_add(1, AtomicOrdering::Relaxed);
            error!(
                worker = %self.name,
                id = %self.id,
                priority = %self.level,
                %failure,
                "worker tick failed; requeueing"
            );
        }

        let offset = u64::try_from(now.saturating_duration_since(self.epoch).as_nanos())
            .unwrap_or(u64::MAX);
        self.last_tick_nanos.store(offset, AtomicOrdering::Release);
        self.tick_count.fetch_add(1, AtomicOrdering::Release);

        let snapshot = timing.snapshot();
        let min_interval = self.min_interval();
        let risky = snapshot.starvation_risk(min_interval, policy.factor, policy.min_samples);
        if risky && !self.starving.swap(true, AtomicOrdering::Relaxed) {
            warn!(
                worker = %self.name,
                priority = %self.level,
                average_interval_us = snapshot.long_average.map(|d| d.as_micros() as u64),
                min_interval_us = min_interval.as_micros() as u64,
                "worker is falling behind its target rate"
            );
        } else if !risky {
            self.starving.store(false, AtomicOrdering::Relaxed);
        }
        *self.published.lock() = snapshot;

        now + min_interval
    }

    pub(crate) fn timing(&self) -> TimingSnapshot {
        *self.published.lock()
    }
}

/// Cloneable control and observation handle for a registered worker.
#[derive(Clone)]
pub struct WorkerHandle {
    slot: Arc<WorkerSlot>,
}

impl WorkerHandle {
    pub(crate) fn new(slot: Arc<WorkerSlot>) -> Self {
        Self { slot }
    }

    pub fn id(&self) -> WorkerId {
        self.slot.id
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn priority_level(&self) -> PriorityLevel {
        self.slot.level
    }

    pub fn thread_affinity(&self) -> ThreadAffinity {
        self.slot.affinity
    }

    pub fn target_frequency_hz(&self) -> f64 {
        self.slot.target_hz
    }

    /// Current adaptive minimum interval between ticks.
    pub fn min_interval_nanos(&self) -> u64 {
        self.slot.min_interval_nanos.load(AtomicOrdering::Relaxed)
    }

    /// Number of completed ticks (failed ticks included).
    pub fn tick_count(&self) -> u64 {
        self.slot.tick_count.load(AtomicOrdering::Acquire)
    }

    /// Number of ticks that returned an error or panicked.
    pub fn failure_count(&self) -> u64 {
        self.slot.failures.load(AtomicOrdering::Relaxed)
    }

    /// Instant of the most recent tick, or of registration before the first one.
    pub fn last_tick(&self) -> Instant {
        self.slot.last_tick()
    }

    /// Seconds until the worker is due; negative when overdue.
    pub fn time_until_due(&self) -> f64 {
        self.slot.time_until_due_at(Instant::now())
    }

    /// [`time_until_due`](Self::time_until_due) scaled by the level weight; the dispatcher's
    /// comparison key (smaller runs first).
    pub fn weighted_due(&self) -> f64 {
        self.time_until_due() * f64::from(self.slot.level.weight())
    }

    /// Halve the tick rate by doubling the minimum interval.
    ///
    /// Applies to the pending tick as well: a queued or sleeping worker is re-keyed to
    /// `last_tick + new interval`.
    pub fn less_ticks(&self) {
        let _ = self.slot.min_interval_nanos.fetch_update(
            AtomicOrdering::Relaxed,
            AtomicOrdering::Relaxed,
            |nanos| Some(nanos.saturating_mul(2)),
        );
        self.slot.rate_changed();
    }

    /// Double the tick rate by halving the minimum interval (never below 1 ns).
    pub fn more_ticks(&self) {
        let _ = self.slot.min_interval_nanos.fetch_update(
            AtomicOrdering::Relaxed,
            AtomicOrdering::Relaxed,
            |nanos| Some((nanos / 2).max(1)),
        );
        self.slot.rate_changed();
    }

    /// Restore the interval derived from the target frequency.
    pub fn reset_rate(&self) {
        self.slot
            .min_interval_nanos
            .store(self.slot.base_interval_nanos, AtomicOrdering::Relaxed);
        self.slot.rate_changed();
    }

    /// Statistics most recently published by the ticking thread.
    pub fn timing(&self) -> TimingSnapshot {
        self.slot.timing()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.slot.id)
            .field("name", &self.slot.name)
            .field("priority", &self.slot.level)
            .field("affinity", &self.slot.affinity)
            .finish()
    }
}
