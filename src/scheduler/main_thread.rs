//! Main-thread domain.
//!
//! Main-affinity workers are never touched by scheduler threads. The game loop calls
//! [`WorkerScheduler::pump_main_thread`](crate::WorkerScheduler::pump_main_thread) once per frame,
//! which ticks at most one due worker, so the per-frame scheduling cost is one heap operation plus
//! one tick.

use super::due_queue::DueQueue;
use crate::error::SchedulerError;
use crate::worker::WorkerSlot;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

#[derive(Default)]
pub(crate) struct MainDomain {
    queue: DueQueue,
    /// Thread that pumped first; every later pump must come from it.
    bound: Option<ThreadId>,
}

impl MainDomain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, slot: Arc<WorkerSlot>, due: Instant) {
        self.queue.push(slot, due);
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Re-key a queued main worker after a rate hook.
    pub(crate) fn rekey(&mut self, slot: &WorkerSlot) {
        self.queue.rekey(slot.id(), slot.level());
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }

    /// Bind the calling thread as the main thread on first use, reject any other thread after.
    pub(crate) fn check_thread(&mut self) -> Result<(), SchedulerError> {
        let current = thread::current().id();
        match self.bound {
            Some(bound) if bound != current => Err(SchedulerError::NotMainThread),
            Some(_) => Ok(()),
            None => {
                self.bound = Some(current);
                Ok(())
            }
        }
    }

    /// Take the most overdue main worker, if any is due.
    pub(crate) fn take_due(&mut self, now: Instant) -> Option<Arc<WorkerSlot>> {
        self.queue.pop_most_overdue(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_pumping_thread_is_bound() {
        let mut domain = MainDomain::new();
        assert!(domain.check_thread().is_ok());
        assert!(domain.check_thread().is_ok());

        let foreign = std::thread::spawn(move || {
            let result = domain.check_thread();
            matches!(result, Err(SchedulerError::NotMainThread))
        });
        assert!(foreign.join().unwrap());
    }
}
