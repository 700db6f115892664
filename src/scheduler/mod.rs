//! Worker dispatcher with three disjoint execution domains.
//!
//! Workers are partitioned at registration by [`ThreadAffinity`] and stay in their domain for
//! life:
//! - **Main**: ticked from [`WorkerScheduler::pump_main_thread`], at most one per call
//! - **Dedicated**: one thread per worker, spawned by [`WorkerScheduler::start`]
//! - **Pool**: `pool_threads` threads sharing one weighted deadline queue
//!
//! Every domain only guarantees a lower bound on the spacing between two ticks of the same worker
//! (its current minimum interval). Under load the spacing grows; nothing is ever preempted.

mod dedicated;
mod due_queue;
mod main_thread;
mod pool;

use crate::config::SchedulerConfig;
use crate::error::{validate_frequency, RegistrationError, SchedulerError};
use crate::stats::WorkerStats;
use crate::threading::set_thread_core;
use crate::worker::{StarvationPolicy, ThreadAffinity, Worker, WorkerHandle, WorkerId, WorkerSlot};
use crossbeam_channel::{bounded, Receiver, Sender};
use main_thread::MainDomain;
use parking_lot::{Mutex, RwLock};
use pool::PoolDomain;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where the scheduler is in its life cycle.
enum Lifecycle {
    /// Pool and dedicated registrations are accepted.
    Registering,
    Running {
        threads: Vec<JoinHandle<()>>,
        /// Dropped to interrupt every dedicated thread's sleep.
        dedicated_shutdown: Sender<()>,
    },
    Stopped,
}

/// Dispatches registered workers across the main, dedicated and pool domains.
///
/// Constructed explicitly and shared by reference (or `Arc`) with whatever needs it; there is no
/// process-wide instance.
pub struct WorkerScheduler {
    config: SchedulerConfig,
    policy: StarvationPolicy,
    next_id: AtomicU64,
    registry: RwLock<Vec<WorkerHandle>>,
    main: Arc<Mutex<MainDomain>>,
    pool: Arc<PoolDomain>,
    /// Dedicated workers (with their rate-change receiver) waiting for `start` to give them a
    /// thread.
    dedicated: Mutex<Vec<(Arc<WorkerSlot>, Receiver<()>)>>,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkerScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            policy: StarvationPolicy::from_config(&config),
            config,
            next_id: AtomicU64::new(0),
            registry: RwLock::new(Vec::new()),
            main: Arc::new(Mutex::new(MainDomain::new())),
            pool: Arc::new(PoolDomain::new()),
            dedicated: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::Registering),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a worker into the domain selected by `affinity`.
    ///
    /// Pool and dedicated workers must be registered before [`start`](Self::start); main workers
    /// may be registered at any time. The worker's first tick becomes due one interval after
    /// registration.
    ///
    /// # Errors
    /// - [`RegistrationError::InvalidFrequency`] for a non-finite or non-positive target frequency
    /// - [`RegistrationError::DomainStarted`] when the pool/dedicated threads already started
    /// - [`RegistrationError::NoPoolThreads`] for pool workers when `pool_threads` is zero
    /// - [`RegistrationError::SchedulerStopped`] after [`shutdown`](Self::shutdown)
    pub fn register<W: Worker>(
        &self,
        worker: W,
        affinity: ThreadAffinity,
    ) -> Result<WorkerHandle, RegistrationError> {
        let name = worker.name().to_string();
        validate_frequency(&name, worker.target_frequency_hz())?;
        if affinity == ThreadAffinity::Pool && self.config.pool_threads == 0 {
            return Err(RegistrationError::NoPoolThreads { name });
        }

        // Held across the domain insert so `start` cannot slip in between check and insert.
        let lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Stopped => return Err(RegistrationError::SchedulerStopped { name }),
            Lifecycle::Running { .. } if affinity != ThreadAffinity::MainOnly => {
                return Err(RegistrationError::DomainStarted { name, affinity });
            }
            _ => {}
        }

        let id = WorkerId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let registered_at = Instant::now();
        let slot = Arc::new(WorkerSlot::new(id, Box::new(worker), affinity, registered_at));
        let due = slot.next_due();
        // Rate hooks re-key the pending tick in whichever domain owns the worker.
        match affinity {
            ThreadAffinity::MainOnly => {
                let main = Arc::downgrade(&self.main);
                slot.set_rate_listener(Box::new(move |slot: &WorkerSlot| {
                    if let Some(main) = main.upgrade() {
                        main.lock().rekey(slot);
                    }
                }));
                self.main.lock().push(slot.clone(), due);
            }
            ThreadAffinity::Pool => {
                let pool = Arc::downgrade(&self.pool);
                slot.set_rate_listener(Box::new(move |slot: &WorkerSlot| {
                    if let Some(pool) = pool.upgrade() {
                        pool.rekey(slot);
                    }
                }));
                self.pool.push(slot.clone(), due);
            }
            ThreadAffinity::Dedicated => {
                let (wake, rate_changed) = bounded::<()>(1);
                slot.set_rate_listener(Box::new(move |_: &WorkerSlot| {
                    // A wake-up already pending covers this change too.
                    let _ = wake.try_send(());
                }));
                self.dedicated.lock().push((slot.clone(), rate_changed));
            }
        }
        drop(lifecycle);

        debug!(
            worker = %name,
            %id,
            priority = %slot.level(),
            %affinity,
            "registered worker"
        );
        let handle = WorkerHandle::new(slot);
        self.registry.write().push(handle.clone());
        Ok(handle)
    }

    /// Register a worker using the affinity it declares through [`Worker::thread_affinity`].
    pub fn register_worker<W: Worker>(&self, worker: W) -> Result<WorkerHandle, RegistrationError> {
        let affinity = worker.thread_affinity();
        self.register(worker, affinity)
    }

    /// Spawn the pool threads and one thread per dedicated worker.
    ///
    /// # Errors
    /// [`SchedulerError::AlreadyStarted`] on a second call, [`SchedulerError::ShutDown`] after
    /// shutdown, [`SchedulerError::Spawn`] if the OS refuses a thread (threads spawned so far are
    /// stopped again).
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Registering => {}
            Lifecycle::Running { .. } => return Err(SchedulerError::AlreadyStarted),
            Lifecycle::Stopped => return Err(SchedulerError::ShutDown),
        }

        let (dedicated_shutdown, shutdown_rx) = bounded::<()>(0);
        let mut threads = Vec::new();
        let prefix = &self.config.thread_name_prefix;

        for idx in 0..self.config.pool_threads {
            let domain = self.pool.clone();
            let policy = self.policy;
            let core = if self.config.pool_cores.is_empty() {
                None
            } else {
                Some(self.config.pool_cores[idx % self.config.pool_cores.len()])
            };
            let name = format!("{prefix}-pool-{idx}");
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                if let Some(core_id) = core {
                    if !set_thread_core(core_id) {
                        warn!(core = core_id, "could not pin pool thread");
                    }
                }
                pool::pool_loop(domain, policy);
            });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    self.abort_start(threads);
                    *lifecycle = Lifecycle::Stopped;
                    return Err(SchedulerError::Spawn { name, source });
                }
            }
        }

        let dedicated: Vec<(Arc<WorkerSlot>, Receiver<()>)> =
            self.dedicated.lock().drain(..).collect();
        for (slot, rate_changed) in dedicated {
            let rx = shutdown_rx.clone();
            let policy = self.policy;
            let elevate = self.config.elevate_dedicated_threads;
            let name = format!("{prefix}-{}", slot.name());
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || dedicated::dedicated_loop(slot, rx, rate_changed, policy, elevate));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    drop(dedicated_shutdown);
                    self.abort_start(threads);
                    *lifecycle = Lifecycle::Stopped;
                    return Err(SchedulerError::Spawn { name, source });
                }
            }
        }

        info!(
            pool_threads = self.config.pool_threads,
            total_threads = threads.len(),
            "worker scheduler started"
        );
        *lifecycle = Lifecycle::Running {
            threads,
            dedicated_shutdown,
        };
        Ok(())
    }

    fn abort_start(&self, threads: Vec<JoinHandle<()>>) {
        self.pool.stop();
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Tick the most overdue main-affinity worker, if one is due. Call once per frame.
    ///
    /// Returns the id of the worker that was ticked. The first thread to call this becomes the
    /// main thread; calls from any other thread fail with [`SchedulerError::NotMainThread`].
    pub fn pump_main_thread(&self) -> Result<Option<WorkerId>, SchedulerError> {
        if matches!(*self.lifecycle.lock(), Lifecycle::Stopped) {
            return Err(SchedulerError::ShutDown);
        }
        let slot = {
            let mut main = self.main.lock();
            main.check_thread()?;
            main.take_due(Instant::now())
        };
        let Some(slot) = slot else {
            return Ok(None);
        };
        // Tick outside the lock so a main worker may register other main workers.
        let due = slot.run_tick(self.policy);
        let id = slot.id();
        self.main.lock().push(slot, due);
        Ok(Some(id))
    }

    /// Handles of every registered worker, in registration order.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.registry.read().clone()
    }

    /// Look up a worker by its diagnostic name (first match).
    pub fn handle(&self, name: &str) -> Option<WorkerHandle> {
        self.registry
            .read()
            .iter()
            .find(|handle| handle.name() == name)
            .cloned()
    }

    /// Per-worker statistics snapshot, in registration order.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.registry
            .read()
            .iter()
            .map(|handle| WorkerStats::collect(handle, self.policy))
            .collect()
    }

    /// Workers currently waiting in the pool queue (excludes those being ticked).
    pub fn pool_queue_len(&self) -> usize {
        self.pool.len()
    }

    /// Workers currently waiting in the main-thread queue.
    pub fn main_queue_len(&self) -> usize {
        self.main.lock().len()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Stop every domain and join the scheduler's threads. Idempotent.
    ///
    /// Blocked and sleeping threads are woken and exit; a thread in the middle of a tick finishes
    /// that tick first. A pathological tick therefore delays shutdown for as long as it runs.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        self.pool.stop();
        self.main.lock().clear();
        self.dedicated.lock().clear();

        if let Lifecycle::Running {
            threads,
            dedicated_shutdown,
        } = previous
        {
            drop(dedicated_shutdown);
            let current = thread::current().id();
            for handle in threads {
                // A worker shutting the scheduler down from its own tick cannot join itself.
                if handle.thread().id() == current {
                    continue;
                }
                let _ = handle.join();
            }
            info!("worker scheduler stopped");
        }
    }
}

impl Default for WorkerScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::PriorityLevel;
    use crate::worker::tests::CountingWorker;
    use std::time::Duration;

    #[test]
    fn rejects_invalid_frequency() {
        let scheduler = WorkerScheduler::new(SchedulerConfig::with_pool_threads(1));
        let err = scheduler
            .register(
                CountingWorker::new("bad", PriorityLevel::Low, 0.0),
                ThreadAffinity::Pool,
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidFrequency { .. }));
        assert!(scheduler.handles().is_empty());
    }

    #[test]
    fn rejects_pool_registration_without_pool_threads() {
        let scheduler = WorkerScheduler::new(SchedulerConfig::with_pool_threads(0));
        let err = scheduler
            .register(
                CountingWorker::new("physics", PriorityLevel::High, 60.0),
                ThreadAffinity::Pool,
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::NoPoolThreads { .. }));
    }

    #[test]
    fn rejects_threaded_registration_after_start() {
        let scheduler = WorkerScheduler::new(SchedulerConfig::with_pool_threads(1));
        scheduler.start().unwrap();
        for affinity in [ThreadAffinity::Pool, ThreadAffinity::Dedicated] {
            let err = scheduler
                .register(CountingWorker::new("late", PriorityLevel::Low, 5.0), affinity)
                .unwrap_err();
            assert!(matches!(err, RegistrationError::DomainStarted { .. }));
        }
        // Main workers are pumped by the caller, so late registration is fine.
        assert!(scheduler
            .register(
                CountingWorker::new("late-main", PriorityLevel::Low, 5.0),
                ThreadAffinity::MainOnly
            )
            .is_ok());
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::AlreadyStarted)
        ));
        scheduler.shutdown();
        assert!(matches!(scheduler.start(), Err(SchedulerError::ShutDown)));
    }

    #[test]
    fn registration_after_shutdown_reports_stopped() {
        let scheduler = WorkerScheduler::new(SchedulerConfig::with_pool_threads(1));
        scheduler.start().unwrap();
        scheduler.shutdown();
        for affinity in [
            ThreadAffinity::Pool,
            ThreadAffinity::Dedicated,
            ThreadAffinity::MainOnly,
        ] {
            let err = scheduler
                .register(CountingWorker::new("late", PriorityLevel::Low, 5.0), affinity)
                .unwrap_err();
            assert!(
                matches!(err, RegistrationError::SchedulerStopped { .. }),
                "{affinity}: {err}"
            );
        }
    }

    #[test]
    fn pump_ticks_nothing_before_due() {
        let scheduler = WorkerScheduler::new(SchedulerConfig::with_pool_threads(0));
        let worker = CountingWorker::new("render", PriorityLevel::Medium, 1.0);
        let ticks = worker.ticks.clone();
        scheduler
            .register(worker, ThreadAffinity::MainOnly)
            .unwrap();
        assert_eq!(scheduler.pump_main_thread().unwrap(), None);
        assert_eq!(ticks.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(scheduler.main_queue_len(), 1);
    }

    #[test]
    fn pump_ticks_at_most_one_worker_per_call() {
        let scheduler = WorkerScheduler::new(SchedulerConfig::with_pool_threads(0));
        let a = CountingWorker::new("a", PriorityLevel::Low, 1000.0);
        let b = CountingWorker::new("b", PriorityLevel::Low, 1000.0);
        let (ta, tb) = (a.ticks.clone(), b.ticks.clone());
        scheduler.register(a, ThreadAffinity::MainOnly).unwrap();
        scheduler.register(b, ThreadAffinity::MainOnly).unwrap();
        thread::sleep(Duration::from_millis(5));

        assert!(scheduler.pump_main_thread().unwrap().is_some());
        let total = ta.load(AtomicOrdering::SeqCst) + tb.load(AtomicOrdering::SeqCst);
        assert_eq!(total, 1);
    }

    #[test]
    fn pump_after_shutdown_fails() {
        let scheduler = WorkerScheduler::new(SchedulerConfig::with_pool_threads(0));
        scheduler.shutdown();
        assert!(matches!(
            scheduler.pump_main_thread(),
            Err(SchedulerError::ShutDown)
        ));
    }

    #[test]
    fn register_worker_uses_declared_affinity() {
        struct Mixer;
        impl Worker for Mixer {
            fn name(&self) -> &str {
                "mixer"
            }
            fn priority_level(&self) -> PriorityLevel {
                PriorityLevel::High
            }
            fn target_frequency_hz(&self) -> f64 {
                50.0
            }
            fn thread_affinity(&self) -> ThreadAffinity {
                ThreadAffinity::Dedicated
            }
            fn tick(&mut self, _elapsed: Duration) -> crate::TickResult {
                Ok(())
            }
        }

        let scheduler = WorkerScheduler::new(SchedulerConfig::with_pool_threads(0));
        let handle = scheduler.register_worker(Mixer).unwrap();
        assert_eq!(handle.thread_affinity(), ThreadAffinity::Dedicated);
        assert_eq!(scheduler.handle("mixer").unwrap().id(), handle.id());
    }
}
