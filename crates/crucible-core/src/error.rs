//! Error types for step execution
//!
//! Expected outcomes (a verified failure, an elapsed deadline) travel inside
//! an `ExecutionResult` with status `Failed`. Only faults that need an
//! operator, such as corrupted persisted state or an unreachable state
//! store, are returned as `Err` from a tick.

use crate::governor::TimeoutScope;
use chrono::{DateTime, Utc};
use crucible_control::ControlError;
use std::time::Duration;
use thiserror::Error;

/// Error type for step execution
#[derive(Debug, Error)]
pub enum StepError {
    /// A transient client failure; absorbed by the retry policy
    #[error("transient failure: {0}")]
    Transient(ControlError),

    /// Every attempt of a single call failed transiently
    #[error("gave up after {attempts} of {max_attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        max_attempts: u32,
        last: ControlError,
    },

    /// The external system confirmed that the operation failed
    #[error("{target}: operation failed on attempt {attempt} of {max_attempts}: {message}")]
    VerifiedFailure {
        target: String,
        request_id: Option<String>,
        message: String,
        attempt: u32,
        max_attempts: u32,
    },

    /// A deadline elapsed
    #[error("{scope} deadline {deadline} exceeded: {elapsed:?} elapsed, limit {limit:?}")]
    Timeout {
        scope: TimeoutScope,
        deadline: DateTime<Utc>,
        elapsed: Duration,
        limit: Duration,
    },

    /// Persisted state violates an invariant
    #[error("invalid persisted state: {0}")]
    InvalidState(String),

    /// The step already reached a terminal failure on an earlier tick
    #[error("step already failed: {0}")]
    AlreadyFailed(String),

    /// Cooperative cancellation observed at tick entry
    #[error("step cancelled")]
    Cancelled,

    /// Non-transient client error
    #[error("client error: {0}")]
    Client(#[from] ControlError),

    /// State store error
    #[error("state store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid step configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// No constructor registered for the step type
    #[error("unknown step type: {0}")]
    UnknownStepType(String),

    /// A dependency needed by the step was not wired in `configure`
    #[error("step not configured: {0}")]
    NotConfigured(String),
}

impl StepError {
    /// Whether this error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, StepError::Timeout { .. })
    }

    /// Whether this error should stop the scheduler from ticking again
    /// without operator involvement
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            StepError::InvalidState(_)
                | StepError::Store(_)
                | StepError::Serialization(_)
                | StepError::NotConfigured(_)
        )
    }
}

/// Result type for step operations
pub type Result<T> = std::result::Result<T, StepError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_error_display() {
        let err = StepError::InvalidState("requested without requests".to_string());
        assert_eq!(
            err.to_string(),
            "invalid persisted state: requested without requests"
        );

        let err = StepError::UnknownStepType("bake-cake".to_string());
        assert_eq!(err.to_string(), "unknown step type: bake-cake");
    }

    #[test]
    fn test_timeout_message_carries_limit_and_deadline() {
        let deadline = Utc.with_ymd_and_hms(2026, 5, 1, 10, 20, 0).unwrap();
        let err = StepError::Timeout {
            scope: TimeoutScope::Step,
            deadline,
            elapsed: Duration::from_secs(1500),
            limit: Duration::from_secs(1200),
        };

        let message = err.to_string();
        assert!(message.contains("2026-05-01 10:20:00"));
        assert!(message.contains("1500s"));
        assert!(message.contains("1200s"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_attempt_messages_carry_limit() {
        let err = StepError::VerifiedFailure {
            target: "node-9".to_string(),
            request_id: Some("r-1".to_string()),
            message: "checksum mismatch".to_string(),
            attempt: 3,
            max_attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "node-9: operation failed on attempt 3 of 3: checksum mismatch"
        );

        let err = StepError::RetryExhausted {
            attempts: 4,
            max_attempts: 4,
            last: ControlError::Busy("slot locked".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "gave up after 4 of 4 attempts: target busy: slot locked"
        );
    }

    #[test]
    fn test_fault_classification() {
        assert!(StepError::InvalidState("x".into()).is_fault());
        assert!(StepError::Store("x".into()).is_fault());
        assert!(!StepError::Cancelled.is_fault());
        assert!(!StepError::Configuration("x".into()).is_fault());
    }

    #[test]
    fn test_from_control_error() {
        let err: StepError = ControlError::Rejected("no such node".into()).into();
        assert!(matches!(err, StepError::Client(ControlError::Rejected(_))));
    }
}
