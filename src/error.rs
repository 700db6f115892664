//! Error types for registration, dispatch and failed ticks.

use crate::worker::ThreadAffinity;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Error a worker's `tick` or a task's `run` may return.
pub type TickError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one tick/run.
pub type TickResult = Result<(), TickError>;

/// Invariant violated at registration time. Never silently accepted.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("`{name}` has invalid target frequency {hz} Hz (must be finite and > 0)")]
    InvalidFrequency { name: String, hz: f64 },
    #[error("cannot register `{name}`: the {affinity} domain has already started")]
    DomainStarted {
        name: String,
        affinity: ThreadAffinity,
    },
    #[error("cannot register `{name}` with pool affinity: the pool has no threads configured")]
    NoPoolThreads { name: String },
    #[error("cannot register `{name}`: the scheduler has been shut down")]
    SchedulerStopped { name: String },
}

/// Errors surfaced by the scheduler and task runner APIs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("scheduler threads have already been started")]
    AlreadyStarted,
    #[error("scheduler has been shut down")]
    ShutDown,
    #[error("pump_main_thread called from a thread other than the bound main thread")]
    NotMainThread,
    #[error("failed to spawn thread `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A tick or run that did not complete normally.
///
/// Never returned to callers: the dispatch boundary logs it, counts it and requeues the unit.
#[derive(Debug)]
pub enum TickFailure {
    Error(TickError),
    Panic(String),
}

impl TickFailure {
    /// Build a failure from the payload of a caught panic.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TickFailure::Panic(message)
    }
}

impl fmt::Display for TickFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickFailure::Error(err) => write!(f, "error: {err}"),
            TickFailure::Panic(msg) => write!(f, "panic: {msg}"),
        }
    }
}

/// Invalid frequencies are rejected before any interval is derived from them.
pub(crate) fn validate_frequency(name: &str, hz: f64) -> Result<(), RegistrationError> {
    if hz.is_finite() && hz > 0.0 {
        Ok(())
    } else {
        Err(RegistrationError::InvalidFrequency {
            name: name.to_string(),
            hz,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_and_non_finite_frequencies() {
        assert!(validate_frequency("a", 0.0).is_err());
        assert!(validate_frequency("a", -3.0).is_err());
        assert!(validate_frequency("a", f64::NAN).is_err());
        assert!(validate_frequency("a", f64::INFINITY).is_err());
        assert!(validate_frequency("a", 0.5).is_ok());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let failure = TickFailure::from_panic(Box::new("boom"));
        assert_eq!(failure.to_string(), "panic: boom");
        let failure = TickFailure::from_panic(Box::new(String::from("owned")));
        assert_eq!(failure.to_string(), "panic: owned");
        let failure = TickFailure::from_panic(Box::new(42_u8));
        assert_eq!(failure.to_string(), "panic: non-string panic payload");
    }

    #[test]
    fn registration_error_wraps_into_scheduler_error() {
        let err: SchedulerError = RegistrationError::NoPoolThreads {
            name: "physics".into(),
        }
        .into();
        assert!(matches!(err, SchedulerError::Registration(_)));
        assert!(err.to_string().contains("physics"));
    }
}
