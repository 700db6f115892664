//! Rolling inter-tick statistics.
//!
//! Each worker owns one [`TimingTracker`]. It is mutated only by the thread currently ticking that
//! worker, so it carries no synchronisation of its own. After every tick the ticking thread
//! publishes a [`TimingSnapshot`] that other threads may read.
//!
//! Two horizons are kept:
//! 1. Short: the last [`SHORT_HORIZON`] intervals, for spotting hitches
//! 2. Long: the last [`LONG_HORIZON`] intervals, for spotting sustained starvation
//!
//! Maxima are reported only once a horizon's buffer is full; until then the query returns `None`.

use std::time::{Duration, Instant};

/// Capacity of the short-horizon ring buffer.
pub const SHORT_HORIZON: usize = 10;
/// Capacity of the long-horizon ring buffer.
pub const LONG_HORIZON: usize = 1000;

/// Which ring buffer a query addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizon {
    Short,
    Long,
}

/// Fixed-capacity ring of interval samples (nanoseconds) with a running sum.
#[derive(Debug, Clone)]
struct RingWindow {
    samples: Box<[u64]>,
    /// Slot the next sample is written to.
    next: usize,
    /// Number of valid samples (saturates at capacity).
    len: usize,
    sum: u128,
}

impl RingWindow {
    fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring window needs a non-zero capacity");
        Self {
            samples: vec![0; capacity].into_boxed_slice(),
            next: 0,
            len: 0,
            sum: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.samples.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// O(1): overwrite the oldest sample once full and adjust the running sum.
    fn push(&mut self, sample: u64) {
        if self.is_full() {
            self.sum -= u128::from(self.samples[self.next]);
        } else {
            self.len += 1;
        }
        self.samples[self.next] = sample;
        self.sum += u128::from(sample);
        self.next = (self.next + 1) % self.capacity();
    }

    fn max(&self) -> Option<u64> {
        if !self.is_full() {
            return None;
        }
        self.samples.iter().copied().max()
    }

    fn average(&self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        Some((self.sum / self.len as u128) as u64)
    }
}

/// Per-worker rolling statistics of inter-tick intervals.
#[derive(Debug, Clone)]
pub struct TimingTracker {
    last_tick: Instant,
    short: RingWindow,
    long: RingWindow,
}

impl TimingTracker {
    /// Create a tracker whose first interval will be measured from `start`.
    pub fn new(start: Instant) -> Self {
        Self::with_capacities(start, SHORT_HORIZON, LONG_HORIZON)
    }

    /// Create a tracker with custom horizon capacities.
    ///
    /// # Panics
    /// Panics if either capacity is zero.
    pub fn with_capacities(start: Instant, short: usize, long: usize) -> Self {
        Self {
            last_tick: start,
            short: RingWindow::with_capacity(short),
            long: RingWindow::with_capacity(long),
        }
    }

    /// Record a tick observed at `now` and return the interval since the previous one.
    ///
    /// A `now` earlier than the previous tick records a zero interval.
    pub fn record_tick(&mut self, now: Instant) -> Duration {
        let interval = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        self.short.push(nanos);
        self.long.push(nanos);
        interval
    }

    /// Timestamp of the most recent tick (or of creation before the first tick).
    pub fn last_tick(&self) -> Instant {
        self.last_tick
    }

    /// Largest interval in the horizon, or `None` until the horizon's buffer is full.
    pub fn max_interval(&self, horizon: Horizon) -> Option<Duration> {
        self.window(horizon).max().map(Duration::from_nanos)
    }

    /// Mean interval over the buffered samples, or `None` before the first sample.
    pub fn average_interval(&self, horizon: Horizon) -> Option<Duration> {
        self.window(horizon).average().map(Duration::from_nanos)
    }

    /// Number of valid samples currently held by the horizon.
    pub fn samples(&self, horizon: Horizon) -> usize {
        self.window(horizon).len
    }

    /// Capacity of the horizon's ring buffer.
    pub fn capacity(&self, horizon: Horizon) -> usize {
        self.window(horizon).capacity()
    }

    /// Immutable copy of the statistics for other threads.
    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            short_max: self.max_interval(Horizon::Short),
            long_max: self.max_interval(Horizon::Long),
            short_average: self.average_interval(Horizon::Short),
            long_average: self.average_interval(Horizon::Long),
            long_samples: self.samples(Horizon::Long),
        }
    }

    fn window(&self, horizon: Horizon) -> &RingWindow {
        match horizon {
            Horizon::Short => &self.short,
            Horizon::Long => &self.long,
        }
    }
}

/// Statistics published by the ticking thread after each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSnapshot {
    pub short_max: Option<Duration>,
    pub long_max: Option<Duration>,
    pub short_average: Option<Duration>,
    pub long_average: Option<Duration>,
    pub long_samples: usize,
}

impl TimingSnapshot {
    /// Whether the observed cadence lags `factor` times behind `min_interval`.
    ///
    /// Uses the long-horizon average and requires at least `min_samples` samples so that a
    /// single hitch right after registration does not count as starvation.
    pub fn starvation_risk(&self, min_interval: Duration, factor: f64, min_samples: usize) -> bool {
        if self.long_samples < min_samples.max(1) {
            return false;
        }
        match self.long_average {
            Some(avg) => avg.as_secs_f64() > min_interval.as_secs_f64() * factor,
            None => false,
        }
    }
}
