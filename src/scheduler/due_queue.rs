//! Deadline heaps ordered by weighted lateness.
//!
//! Every entry is keyed by the absolute instant its worker becomes due, computed once when the
//! entry is inserted. Entries live in one min-heap per [`PriorityLevel`], so within a level the
//! head is always the most overdue worker. Selection compares only the three heads:
//!
//! 1. Read `now` once
//! 2. Skip heads that are not due yet (the interval is a lower bound)
//! 3. Score each due head as `weight × (now − due)`
//! 4. Pop the head with the highest score; ties go to the higher level
//! 5. If the worker's live due instant moved past `now` (a rate hook widened its interval),
//!    reinsert it under the fresh key and select again
//!
//! Scoring `weight × lateness` and taking the maximum is the same ordering as taking the minimum
//! of `weight × time_until_due`, but every comparison uses the same clock read, so the result is
//! deterministic for a given `now`.

use crate::priority::{PriorityLevel, PriorityTable};
use crate::worker::{WorkerId, WorkerSlot};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

/// Worker waiting in a due heap.
pub(crate) struct DueEntry {
    due: Instant,
    /// Insertion order, breaks ties between identical due instants (FIFO).
    seq: u64,
    slot: Arc<WorkerSlot>,
}

impl Ord for DueEntry {
    /// Reverse comparison so `BinaryHeap` pops the earliest due instant first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DueEntry {}

/// One deadline heap per priority level.
#[derive(Default)]
pub(crate) struct DueQueue {
    levels: PriorityTable<BinaryHeap<DueEntry>>,
    next_seq: u64,
}

impl DueQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a worker that becomes due at `due`.
    pub(crate) fn push(&mut self, slot: Arc<WorkerSlot>, due: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.levels[slot.level()].push(DueEntry { due, seq, slot });
    }

    pub(crate) fn len(&self) -> usize {
        self.levels.iter().map(|(_, heap)| heap.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.levels.iter().all(|(_, heap)| heap.is_empty())
    }

    /// Earliest due instant across all levels, used to bound the next wait.
    pub(crate) fn earliest_due(&self) -> Option<Instant> {
        self.levels
            .iter()
            .filter_map(|(_, heap)| heap.peek().map(|entry| entry.due))
            .min()
    }

    /// Remove and return the most overdue worker by weighted lateness, if any is due at `now`.
    pub(crate) fn pop_most_overdue(&mut self, now: Instant) -> Option<Arc<WorkerSlot>> {
        loop {
            let level = self.most_overdue_level(now)?;
            let mut entry = self.levels[level].pop()?;
            let live_due = entry.slot.next_due();
            if live_due <= now {
                return Some(entry.slot);
            }
            // Stale key; the requeued entry is not due at `now`, so the loop terminates.
            entry.due = live_due;
            self.levels[level].push(entry);
        }
    }

    fn most_overdue_level(&self, now: Instant) -> Option<PriorityLevel> {
        let mut best: Option<(PriorityLevel, u128)> = None;
        for level in PriorityLevel::ALL {
            let Some(head) = self.levels[level].peek() else {
                continue;
            };
            if head.due > now {
                continue;
            }
            let lateness = now.duration_since(head.due).as_nanos();
            let score = lateness.saturating_mul(u128::from(level.weight()));
            // Strictly greater: on ties the level visited first (the higher one) keeps the slot.
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((level, score));
            }
        }
        best.map(|(level, _)| level)
    }

    /// Recompute the key of one queued worker from its live due instant.
    ///
    /// Returns `false` when the worker is not queued here (it is being ticked right now, and its
    /// next key will come from the tick itself).
    pub(crate) fn rekey(&mut self, id: WorkerId, level: PriorityLevel) -> bool {
        let heap = &mut self.levels[level];
        if !heap.iter().any(|entry| entry.slot.id() == id) {
            return false;
        }
        let entries = std::mem::take(heap).into_vec();
        *heap = entries
            .into_iter()
            .map(|mut entry| {
                if entry.slot.id() == id {
                    entry.due = entry.slot.next_due();
                }
                entry
            })
            .collect();
        true
    }

    /// Drain every entry (used at shutdown to release worker slots).
    pub(crate) fn clear(&mut self) {
        for level in PriorityLevel::ALL {
            self.levels[level].clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::CountingWorker;
    use crate::worker::{ThreadAffinity, WorkerHandle};
    use std::time::Duration;

    fn slot(id: u64, level: PriorityLevel, start: Instant) -> Arc<WorkerSlot> {
        Arc::new(WorkerSlot::new(
            WorkerId(id),
            Box::new(CountingWorker::new("w", level, 10.0)),
            ThreadAffinity::Pool,
            start,
        ))
    }

    #[test]
    fn nothing_is_returned_before_due() {
        let start = Instant::now();
        let mut queue = DueQueue::new();
        queue.push(slot(1, PriorityLevel::High, start), start + Duration::from_millis(5));
        assert!(queue.pop_most_overdue(start).is_none());
        assert_eq!(queue.earliest_due(), Some(start + Duration::from_millis(5)));
        assert!(queue
            .pop_most_overdue(start + Duration::from_millis(5))
            .is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn high_wins_with_equal_or_greater_lateness() {
        let start = Instant::now();
        let now = start + Duration::from_secs(2);
        for (high_late, other_late) in [(100, 100), (300, 100), (1, 0), (0, 0)] {
            for other_level in [PriorityLevel::Medium, PriorityLevel::Low] {
                let mut queue = DueQueue::new();
                // Insert the lower level first so FIFO order cannot explain the result.
                queue.push(
                    slot(2, other_level, start),
                    now - Duration::from_millis(other_late),
                );
                queue.push(
                    slot(1, PriorityLevel::High, start),
                    now - Duration::from_millis(high_late),
                );
                let first = queue.pop_most_overdue(now).unwrap();
                assert_eq!(
                    first.level(),
                    PriorityLevel::High,
                    "high late {high_late}ms vs {other_level} late {other_late}ms"
                );
            }
        }
    }

    #[test]
    fn weighting_lets_much_later_low_workers_through() {
        let start = Instant::now();
        let now = start + Duration::from_secs(10);
        let mut queue = DueQueue::new();
        queue.push(slot(1, PriorityLevel::High, start), now - Duration::from_millis(1));
        queue.push(slot(2, PriorityLevel::Low, start), now - Duration::from_millis(500));
        assert_eq!(
            queue.pop_most_overdue(now).unwrap().level(),
            PriorityLevel::Low
        );
    }

    #[test]
    fn within_a_level_earliest_due_goes_first() {
        let start = Instant::now();
        let now = start + Duration::from_secs(1);
        let mut queue = DueQueue::new();
        queue.push(slot(1, PriorityLevel::Medium, start), now - Duration::from_millis(10));
        queue.push(slot(2, PriorityLevel::Medium, start), now - Duration::from_millis(30));
        queue.push(slot(3, PriorityLevel::Medium, start), now - Duration::from_millis(30));
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_most_overdue(now))
            .map(|slot| slot.id().0)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn widened_interval_is_honoured_at_pop() {
        let start = Instant::now();
        let mut queue = DueQueue::new();
        let widened = slot(1, PriorityLevel::High, start);
        queue.push(widened.clone(), widened.next_due());
        WorkerHandle::new(widened).less_ticks();

        // Stored key says 100 ms, the live interval says 200 ms.
        assert!(queue.pop_most_overdue(start + Duration::from_millis(150)).is_none());
        assert_eq!(queue.earliest_due(), Some(start + Duration::from_millis(200)));
        assert_eq!(queue.len(), 1);
        assert!(queue
            .pop_most_overdue(start + Duration::from_millis(200))
            .is_some());
    }

    #[test]
    fn rekey_pulls_a_shortened_interval_forward() {
        let start = Instant::now();
        let mut queue = DueQueue::new();
        let other = slot(2, PriorityLevel::Medium, start);
        queue.push(other, start + Duration::from_millis(100));
        let sped_up = slot(1, PriorityLevel::Medium, start);
        queue.push(sped_up.clone(), sped_up.next_due());
        WorkerHandle::new(sped_up).more_ticks();

        assert!(queue.rekey(WorkerId(1), PriorityLevel::Medium));
        assert_eq!(queue.earliest_due(), Some(start + Duration::from_millis(50)));
        let first = queue
            .pop_most_overdue(start + Duration::from_millis(60))
            .unwrap();
        assert_eq!(first.id(), WorkerId(1));
        assert!(!queue.rekey(WorkerId(7), PriorityLevel::Medium));
    }

    #[test]
    fn len_counts_all_levels() {
        let start = Instant::now();
        let mut queue = DueQueue::new();
        for (id, level) in PriorityLevel::ALL.into_iter().enumerate() {
            queue.push(slot(id as u64, level, start), start);
        }
        assert_eq!(queue.len(), 3);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.earliest_due(), None);
    }
}
