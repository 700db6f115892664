//! Transient and indefinite tasks drained by a shared pool of runner threads.
//!
//! Tasks have no affinity and no priority level. Each queued task is keyed by the absolute instant
//! it becomes due (`last run + 1 / target frequency`, or the enqueue instant for a task that never
//! ran), which orders them exactly like the unweighted score `1/freq − elapsed_since_last_run`.
//!
//! Runner loop:
//! 1. Pop the earliest-due task (block while the queue is empty or nothing is due)
//! 2. `run()` it outside the lock; errors and panics are logged
//! 3. Poll `done()`: retire the task, or reinsert it with a fresh due instant
//!
//! Tasks never share a queue with workers; their scores are not comparable with weighted ones.

use crate::config::TaskRunnerConfig;
use crate::error::{validate_frequency, SchedulerError, TickFailure, TickResult};
use crate::stats::TaskRunnerStats;
use crate::worker::interval_nanos;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// A unit of work not known at startup.
pub trait Task: Send + 'static {
    /// Diagnostic name used in logs.
    fn name(&self) -> &str;

    /// Rate at which an indefinite task is re-run. Must be finite and positive.
    fn target_frequency_hz(&self) -> f64;

    fn run(&mut self) -> TickResult;

    /// Polled after every run; the first `true` retires the task for good.
    fn done(&self) -> bool {
        false
    }
}

/// Unweighted task score: seconds until due, negative once overdue (smaller runs first).
pub fn task_score(target_frequency_hz: f64, elapsed_since_last_run: Duration) -> f64 {
    1.0 / target_frequency_hz - elapsed_since_last_run.as_secs_f64()
}

/// Task waiting in the runner queue, ordered by due instant (earliest first).
struct QueuedTask {
    due: Instant,
    /// Insertion order, keeps equal due instants FIFO.
    seq: u64,
    /// Interval used for the last reinsertion, kept if the task later reports a bad frequency.
    interval: Duration,
    task: Box<dyn Task>,
}

impl Ord for QueuedTask {
    /// Reverse comparison so `BinaryHeap` pops the earliest due instant first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

/// State shared by the runner threads and every [`TaskHandle`].
struct TaskShared {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    available: Condvar,
    running: AtomicBool,
    next_seq: AtomicU64,
    /// Enqueued and not yet retired.
    live: AtomicUsize,
    runs: AtomicU64,
    retired: AtomicU64,
    failures: AtomicU64,
}

impl TaskShared {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            runs: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Insert a task unless the runner has stopped; `admit` counts it as a new live task.
    ///
    /// The run flag is checked under the heap lock, so a concurrent `stop` either sees the entry
    /// and drops it, or this call hands the entry back.
    fn push(&self, mut entry: QueuedTask, admit: bool) -> Result<(), QueuedTask> {
        {
            let mut guard = self.heap.lock();
            if !self.running.load(AtomicOrdering::Acquire) {
                return Err(entry);
            }
            entry.seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
            if admit {
                self.live.fetch_add(1, AtomicOrdering::AcqRel);
            }
            guard.push(entry);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop the earliest task once it is due. `None` means the runner is shutting down.
    fn next_due(&self) -> Option<QueuedTask> {
        let mut guard = self.heap.lock();
        loop {
            if !self.running.load(AtomicOrdering::Acquire) {
                return None;
            }
            let head_due = guard.peek().map(|entry| entry.due);
            match head_due {
                Some(due) if due <= Instant::now() => return guard.pop(),
                Some(due) => {
                    let _ = self.available.wait_until(&mut guard, due);
                }
                None => self.available.wait(&mut guard),
            }
        }
    }

    /// Stop accepting and running tasks; returns how many queued tasks were dropped.
    fn stop(&self) -> usize {
        let dropped: Vec<QueuedTask> = {
            let mut guard = self.heap.lock();
            self.running.store(false, AtomicOrdering::Release);
            let dropped: Vec<QueuedTask> = guard.drain().collect();
            self.live.fetch_sub(dropped.len(), AtomicOrdering::AcqRel);
            dropped
        };
        self.available.notify_all();
        // Task destructors run outside the lock; they may hold handles of their own.
        dropped.len()
    }

    fn run_one(&self, mut entry: QueuedTask) {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.task.run()));
        self.runs.fetch_add(1, AtomicOrdering::Relaxed);
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(TickFailure::Error(err)),
            Err(payload) => Some(TickFailure::from_panic(payload)),
        };
        if let Some(failure) = failure {
            self.failures.fetch_add(1, AtomicOrdering::Relaxed);
            error!(task = entry.task.name(), %failure, "task run failed");
        }

        if entry.task.done() {
            self.live.fetch_sub(1, AtomicOrdering::AcqRel);
            self.retired.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(task = entry.task.name(), "task retired");
            return;
        }

        let hz = entry.task.target_frequency_hz();
        if validate_frequency(entry.task.name(), hz).is_ok() {
            entry.interval = Duration::from_nanos(interval_nanos(hz));
        }
        entry.due = started + entry.interval;
        if let Err(entry) = self.push(entry, false) {
            self.live.fetch_sub(1, AtomicOrdering::AcqRel);
            debug!(task = entry.task.name(), "task dropped at shutdown");
        }
    }
}

/// Cloneable producer handle; tasks and workers may hold one to enqueue follow-up work.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    /// Queue a task; it is due immediately.
    ///
    /// # Errors
    /// [`SchedulerError::Registration`] for an invalid target frequency, [`SchedulerError::ShutDown`]
    /// once the runner has been shut down.
    pub fn enqueue<T: Task>(&self, task: T) -> Result<(), SchedulerError> {
        validate_frequency(task.name(), task.target_frequency_hz())?;
        let interval = Duration::from_nanos(interval_nanos(task.target_frequency_hz()));
        let entry = QueuedTask {
            due: Instant::now(),
            seq: 0,
            interval,
            task: Box::new(task),
        };
        self.shared
            .push(entry, true)
            .map_err(|_| SchedulerError::ShutDown)
    }

    /// Tasks enqueued and not yet retired.
    pub fn live_tasks(&self) -> usize {
        self.shared.live.load(AtomicOrdering::Acquire)
    }
}

/// Pool of threads draining one shared task queue.
pub struct TaskRunner {
    config: TaskRunnerConfig,
    shared: Arc<TaskShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Build a runner. Tasks may be enqueued right away; they run once [`start`](Self::start) is
    /// called.
    pub fn new(config: TaskRunnerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(TaskShared::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: self.shared.clone(),
        }
    }

    /// Shorthand for `self.handle().enqueue(task)`.
    pub fn enqueue<T: Task>(&self, task: T) -> Result<(), SchedulerError> {
        self.handle().enqueue(task)
    }

    /// Spawn the runner threads (at least one).
    pub fn start(&self) -> Result<(), SchedulerError> {
        if !self.shared.running.load(AtomicOrdering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Err(SchedulerError::AlreadyStarted);
        }
        let count = self.config.threads.max(1);
        for idx in 0..count {
            let shared = self.shared.clone();
            let name = format!("{}-runner-{idx}", self.config.thread_name_prefix);
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                while let Some(entry) = shared.next_due() {
                    shared.run_one(entry);
                }
                debug!("task runner thread stopping");
            });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    self.shared.stop();
                    for handle in threads.drain(..) {
                        let _ = handle.join();
                    }
                    return Err(SchedulerError::Spawn { name, source });
                }
            }
        }
        info!(threads = count, "task runner started");
        Ok(())
    }

    /// Tasks enqueued and not yet retired (queued or currently running).
    pub fn live_tasks(&self) -> usize {
        self.shared.live.load(AtomicOrdering::Acquire)
    }

    /// Tasks waiting in the queue.
    pub fn queued_tasks(&self) -> usize {
        self.shared.heap.lock().len()
    }

    pub fn stats(&self) -> TaskRunnerStats {
        TaskRunnerStats {
            live: self.live_tasks(),
            queued: self.queued_tasks(),
            runs: self.shared.runs.load(AtomicOrdering::Relaxed),
            retired: self.shared.retired.load(AtomicOrdering::Relaxed),
            failures: self.shared.failures.load(AtomicOrdering::Relaxed),
        }
    }

    /// Stop the runner and join its threads. Queued tasks are dropped; running tasks finish their
    /// current run first. Idempotent.
    pub fn shutdown(&self) {
        let dropped = self.shared.stop();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        let joined = !threads.is_empty();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        if joined {
            info!(dropped, "task runner stopped");
        }
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(TaskRunnerConfig::default())
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneShot {
        runs: Arc<AtomicUsize>,
    }

    impl Task for OneShot {
        fn name(&self) -> &str {
            "one-shot"
        }
        fn target_frequency_hz(&self) -> f64 {
            1000.0
        }
        fn run(&mut self) -> TickResult {
            self.runs.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
        fn done(&self) -> bool {
            self.runs.load(AtomicOrdering::SeqCst) >= 1
        }
    }

    #[test]
    fn score_matches_interval_minus_elapsed() {
        assert!((task_score(4.0, Duration::ZERO) - 0.25).abs() < 1e-9);
        assert!((task_score(10.0, Duration::from_millis(300)) + 0.2).abs() < 1e-9);
    }

    #[test]
    fn earlier_due_pops_first_then_fifo() {
        let shared = TaskShared::new();
        let now = Instant::now();
        for (due_ms, name_runs) in [(5_u64, 0), (0, 1), (0, 2)] {
            let runs = Arc::new(AtomicUsize::new(name_runs));
            let pushed = shared.push(
                QueuedTask {
                    due: now + Duration::from_millis(due_ms),
                    seq: 0,
                    interval: Duration::from_millis(1),
                    task: Box::new(OneShot { runs }),
                },
                true,
            );
            assert!(pushed.is_ok());
        }
        let mut heap = shared.heap.lock();
        let first = heap.pop().unwrap();
        let second = heap.pop().unwrap();
        let third = heap.pop().unwrap();
        assert_eq!(first.due, now);
        assert!(first.seq < second.seq);
        assert_eq!(third.due, now + Duration::from_millis(5));
    }

    #[test]
    fn rejects_invalid_frequency_and_enqueue_after_shutdown() {
        struct Bad;
        impl Task for Bad {
            fn name(&self) -> &str {
                "bad"
            }
            fn target_frequency_hz(&self) -> f64 {
                -1.0
            }
            fn run(&mut self) -> TickResult {
                Ok(())
            }
        }

        let runner = TaskRunner::new(TaskRunnerConfig::with_threads(1));
        assert!(matches!(
            runner.enqueue(Bad),
            Err(SchedulerError::Registration(_))
        ));
        runner.shutdown();
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            runner.enqueue(OneShot { runs }),
            Err(SchedulerError::ShutDown)
        ));
        assert!(matches!(runner.start(), Err(SchedulerError::ShutDown)));
    }

    #[test]
    fn stop_releases_live_count_of_dropped_tasks() {
        let runner = TaskRunner::new(TaskRunnerConfig::with_threads(1));
        for _ in 0..3 {
            let runs = Arc::new(AtomicUsize::new(0));
            runner.enqueue(OneShot { runs }).unwrap();
        }
        assert_eq!(runner.live_tasks(), 3);
        runner.shutdown();
        assert_eq!(runner.live_tasks(), 0);
        assert_eq!(runner.queued_tasks(), 0);
    }

    #[test]
    fn push_after_stop_hands_the_task_back() {
        let shared = TaskShared::new();
        assert_eq!(shared.stop(), 0);
        let runs = Arc::new(AtomicUsize::new(0));
        let rejected = shared.push(
            QueuedTask {
                due: Instant::now(),
                seq: 0,
                interval: Duration::from_millis(1),
                task: Box::new(OneShot { runs }),
            },
            true,
        );
        assert!(rejected.is_err());
        assert_eq!(shared.live.load(AtomicOrdering::SeqCst), 0);
        assert!(shared.heap.lock().is_empty());
    }

    #[test]
    fn requeue_after_stop_retires_the_live_count() {
        let shared = TaskShared::new();
        let runs = Arc::new(AtomicUsize::new(0));
        // Never done, so `run_one` tries to requeue it.
        struct Forever(Arc<AtomicUsize>);
        impl Task for Forever {
            fn name(&self) -> &str {
                "forever"
            }
            fn target_frequency_hz(&self) -> f64 {
                100.0
            }
            fn run(&mut self) -> TickResult {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        }
        let entry = QueuedTask {
            due: Instant::now(),
            seq: 0,
            interval: Duration::from_millis(10),
            task: Box::new(Forever(runs.clone())),
        };
        assert!(shared.push(entry, true).is_ok());
        let in_flight = shared.next_due().unwrap();
        shared.stop();
        assert_eq!(shared.live.load(AtomicOrdering::SeqCst), 1);

        shared.run_one(in_flight);
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(shared.live.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn queued_before_start_counts_as_live() {
        let runner = TaskRunner::new(TaskRunnerConfig::with_threads(1));
        let runs = Arc::new(AtomicUsize::new(0));
        runner.enqueue(OneShot { runs: runs.clone() }).unwrap();
        assert_eq!(runner.live_tasks(), 1);
        assert_eq!(runner.queued_tasks(), 1);
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 0);
    }
}
