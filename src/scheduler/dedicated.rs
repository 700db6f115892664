//! Dedicated worker threads.
//!
//! Each dedicated worker is bound to one thread for its whole life, for workers that own
//! thread-affine native resources. The thread sleeps until the worker is due, ticks it and
//! repeats. The sleep is a `select!` over two channels with the time until due as timeout:
//! - shutdown: dropping the sender interrupts every sleeping dedicated thread at once
//! - rate change: a rate hook wakes this worker's thread so it recomputes its deadline

use crate::threading::set_thread_priority;
use crate::worker::{StarvationPolicy, WorkerSlot};
use crossbeam_channel::{select, Receiver};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Dedicated thread body.
///
/// The due instant is re-read from the slot after every wake-up, so `less_ticks`/`more_ticks`
/// also apply to the sleep in progress.
pub(crate) fn dedicated_loop(
    slot: Arc<WorkerSlot>,
    shutdown: Receiver<()>,
    rate_changed: Receiver<()>,
    policy: StarvationPolicy,
    elevate: bool,
) {
    if elevate && !set_thread_priority(slot.level()) {
        warn!(
            worker = slot.name(),
            priority = %slot.level(),
            "could not raise dedicated thread priority"
        );
    }
    debug!(worker = slot.name(), "dedicated thread started");
    loop {
        let wait = slot.next_due().saturating_duration_since(Instant::now());
        select! {
            // Nothing is ever sent; a message or a dropped sender both mean shut down.
            recv(shutdown) -> _ => break,
            recv(rate_changed) -> _ => continue,
            default(wait) => {}
        }
        if Instant::now() < slot.next_due() {
            continue;
        }
        slot.run_tick(policy);
    }
    debug!(worker = slot.name(), "dedicated thread stopping");
}
