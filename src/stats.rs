//! Serializable statistics snapshots for external monitors.
//!
//! Nothing here feeds back into scheduling. A load monitor outside the core can read these, decide
//! that a worker is starving or that the frame budget is blown, and respond through
//! [`WorkerHandle::less_ticks`] / [`WorkerHandle::more_ticks`].

use crate::priority::PriorityLevel;
use crate::worker::{StarvationPolicy, ThreadAffinity, WorkerHandle, WorkerId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub name: String,
    pub priority: PriorityLevel,
    pub affinity: ThreadAffinity,
    pub target_frequency_hz: f64,
    #[serde(with = "duration_micros")]
    pub min_interval: Duration,
    pub tick_count: u64,
    pub failures: u64,
    /// Signed seconds until due when the snapshot was taken.
    pub time_until_due: f64,
    #[serde(with = "duration_micros_option")]
    pub short_max_interval: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub long_max_interval: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub short_average_interval: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub long_average_interval: Option<Duration>,
    /// Long-horizon average interval far above the minimum interval.
    pub starvation_risk: bool,
}

impl WorkerStats {
    pub(crate) fn collect(handle: &WorkerHandle, policy: StarvationPolicy) -> Self {
        let timing = handle.timing();
        let min_interval = Duration::from_nanos(handle.min_interval_nanos());
        Self {
            id: handle.id(),
            name: handle.name().to_string(),
            priority: handle.priority_level(),
            affinity: handle.thread_affinity(),
            target_frequency_hz: handle.target_frequency_hz(),
            min_interval,
            tick_count: handle.tick_count(),
            failures: handle.failure_count(),
            time_until_due: handle.time_until_due(),
            short_max_interval: timing.short_max,
            long_max_interval: timing.long_max,
            short_average_interval: timing.short_average,
            long_average_interval: timing.long_average,
            starvation_risk: timing.starvation_risk(min_interval, policy.factor, policy.min_samples),
        }
    }
}

/// Point-in-time view of a task runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunnerStats {
    /// Tasks enqueued and not yet retired (queued or running).
    pub live: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    pub runs: u64,
    pub retired: u64,
    pub failures: u64,
}

// Whole microseconds survive a round trip exactly.
fn to_micros(duration: &Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000.0
}

fn from_micros(micros: f64) -> Duration {
    Duration::from_nanos((micros.max(0.0) * 1_000.0).round() as u64)
}

mod duration_micros {
    use super::{from_micros, to_micros};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(to_micros(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = f64::deserialize(deserializer)?;
        Ok(from_micros(micros))
    }
}

mod duration_micros_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&super::to_micros(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<f64> = Option::deserialize(deserializer)?;
        Ok(opt.map(super::from_micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_serialize_as_microseconds() {
        let stats = WorkerStats {
            id: WorkerId(3),
            name: "terrain".into(),
            priority: PriorityLevel::Low,
            affinity: ThreadAffinity::Pool,
            target_frequency_hz: 5.0,
            min_interval: Duration::from_millis(200),
            tick_count: 12,
            failures: 0,
            time_until_due: 0.1,
            short_max_interval: Some(Duration::from_micros(250)),
            long_max_interval: None,
            short_average_interval: None,
            long_average_interval: None,
            starvation_risk: false,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["min_interval"], 200_000.0);
        assert_eq!(value["short_max_interval"], 250.0);
        assert!(value["long_max_interval"].is_null());
        assert_eq!(value["priority"], "low");
        assert_eq!(value["affinity"], "pool");

        let back: WorkerStats = serde_json::from_value(value).unwrap();
        assert_eq!(back.min_interval, Duration::from_millis(200));
        assert_eq!(back.long_max_interval, None);
    }
}
