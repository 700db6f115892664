//! Shared worker pool.
//!
//! All pool threads share one [`DueQueue`] protected by a mutex and condition variable. A thread:
//! 1. Pops the most overdue worker (blocks while the queue is empty or nothing is due yet)
//! 2. Ticks it outside the lock
//! 3. Reinserts it with the due instant returned by the tick and wakes one waiter
//!
//! A worker is absent from the queue while it is being ticked, so no two pool threads can ever
//! tick the same worker concurrently.

use super::due_queue::DueQueue;
use crate::worker::{StarvationPolicy, WorkerSlot};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Shared due queue plus the pool's run flag.
pub(crate) struct PoolDomain {
    queue: Mutex<DueQueue>,
    /// Pool threads wait on this when nothing is due; pushes and shutdown notify it.
    available: Condvar,
    running: AtomicBool,
}

impl PoolDomain {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(DueQueue::new()),
            available: Condvar::new(),
            running: AtomicBool::new(true),
        }
    }

    /// Insert a worker and wake one waiting pool thread so it can re-evaluate its wait.
    pub(crate) fn push(&self, slot: Arc<WorkerSlot>, due: Instant) {
        self.queue.lock().push(slot, due);
        self.available.notify_one();
    }

    /// Re-key a queued worker after a rate hook and wake every waiter so each re-evaluates its
    /// deadline.
    pub(crate) fn rekey(&self, slot: &WorkerSlot) {
        let moved = self.queue.lock().rekey(slot.id(), slot.level());
        if moved {
            self.available.notify_all();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Pop the next worker to tick, blocking until one is due.
    ///
    /// Returns `None` once the pool has been stopped; that wake-up is the pool's shutdown signal.
    pub(crate) fn next_due(&self) -> Option<Arc<WorkerSlot>> {
        let mut guard = self.queue.lock();
        loop {
            if !self.running.load(AtomicOrdering::Acquire) {
                return None;
            }
            if let Some(slot) = guard.pop_most_overdue(Instant::now()) {
                return Some(slot);
            }
            match guard.earliest_due() {
                // Woken early by a push or shutdown, or on time; either way re-evaluate.
                Some(due) => {
                    let _ = self.available.wait_until(&mut guard, due);
                }
                None => self.available.wait(&mut guard),
            }
        }
    }

    /// Stop the pool: blocked threads return `None`, threads mid-tick exit after their tick.
    pub(crate) fn stop(&self) {
        {
            // Flip the flag under the lock so no thread can miss the notification below.
            let mut guard = self.queue.lock();
            self.running.store(false, AtomicOrdering::Release);
            guard.clear();
        }
        self.available.notify_all();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }
}

/// Pool thread body: tick whatever is most overdue until the pool stops.
pub(crate) fn pool_loop(domain: Arc<PoolDomain>, policy: StarvationPolicy) {
    while let Some(slot) = domain.next_due() {
        let due = slot.run_tick(policy);
        if domain.is_running() {
            domain.push(slot, due);
        }
    }
    debug!("pool thread stopping");
}
