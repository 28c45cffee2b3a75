//! Error taxonomy shared by activities, orchestrations and the client.
use thiserror::Error;

use crate::providers::ProviderError;

/// Error returned by an activity handler.
///
/// Transient errors are retried by the dispatcher according to the
/// runtime's `RetryPolicy`; permanent errors are recorded immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl ActivityError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ActivityError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        ActivityError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ActivityError::Transient(m) | ActivityError::Permanent(m) => m,
        }
    }
}

impl From<String> for ActivityError {
    fn from(s: String) -> Self {
        ActivityError::Permanent(s)
    }
}

impl From<&str> for ActivityError {
    fn from(s: &str) -> Self {
        ActivityError::Permanent(s.to_string())
    }
}

/// What an orchestration observes when awaiting a durable future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The activity failed permanently or exhausted its retries.
    #[error("{0}")]
    Failed(String),
    /// The branch did not complete before its fan-in deadline.
    #[error("timed out")]
    TimedOut,
}

impl From<TaskError> for String {
    fn from(e: TaskError) -> Self {
        e.to_string()
    }
}

/// Client-facing error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("concurrency conflict on {instance}: expected version {expected}, found {actual}")]
    ConcurrencyConflict { instance: String, expected: u64, actual: u64 },

    #[error("replay divergence: {0}")]
    ReplayDivergence(String),

    #[error("orchestration failed: {0}")]
    OrchestrationFailed(String),

    #[error("orchestration terminated: {0}")]
    Terminated(String),

    #[error("instance {0} is not terminal")]
    NotTerminal(String),

    #[error("timed out waiting for instance {0}")]
    WaitTimeout(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::InstanceNotFound(id) => EngineError::InstanceNotFound(id),
            ProviderError::ConcurrencyConflict {
                instance,
                expected,
                actual,
            } => EngineError::ConcurrencyConflict {
                instance,
                expected,
                actual,
            },
            other => EngineError::Provider(other),
        }
    }
}

impl EngineError {
    /// Map a terminal failure message onto the matching variant.
    pub(crate) fn from_failure(error: String) -> Self {
        match error.strip_prefix(crate::runtime::DIVERGENCE_PREFIX) {
            Some(detail) => EngineError::ReplayDivergence(detail.to_string()),
            None => EngineError::OrchestrationFailed(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_errors_are_permanent() {
        let e: ActivityError = "boom".to_string().into();
        assert_eq!(e, ActivityError::Permanent("boom".into()));
        assert!(!e.is_transient());
        assert!(ActivityError::transient("flaky").is_transient());
    }

    #[test]
    fn task_error_converts_to_string_for_question_mark() {
        fn orchestration_step() -> Result<String, String> {
            Err(TaskError::Failed("card declined".into()))?
        }
        assert_eq!(orchestration_step().unwrap_err(), "card declined");
        assert_eq!(String::from(TaskError::TimedOut), "timed out");
    }

    #[test]
    fn provider_errors_map_onto_engine_variants() {
        let e: EngineError = ProviderError::InstanceNotFound("i1".into()).into();
        assert!(matches!(e, EngineError::InstanceNotFound(ref id) if id == "i1"));

        let e: EngineError = ProviderError::ConcurrencyConflict {
            instance: "i1".into(),
            expected: 2,
            actual: 3,
        }
        .into();
        assert!(matches!(e, EngineError::ConcurrencyConflict { expected: 2, actual: 3, .. }));

        let e: EngineError = ProviderError::storage("append", "disk full", true).into();
        assert!(matches!(e, EngineError::Provider(_)));
    }

    #[test]
    fn failures_split_divergence_from_orchestration_errors() {
        let e = EngineError::from_failure("replay divergence: expected activity A at seq 1".into());
        assert!(matches!(e, EngineError::ReplayDivergence(ref d) if d == "expected activity A at seq 1"));
        assert_eq!(e.to_string(), "replay divergence: expected activity A at seq 1");

        let e = EngineError::from_failure("out of stock".into());
        assert!(matches!(e, EngineError::OrchestrationFailed(ref m) if m == "out of stock"));
    }
}
