//! Error types for control-plane and hardware client calls

use thiserror::Error;

/// Error type for external client calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// The target or tool is busy with another operation
    #[error("target busy: {0}")]
    Busy(String),

    /// A conflicting change is already in flight
    #[error("conflicting request: {0}")]
    Conflict(String),

    /// The control plane asked the caller to slow down
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Connection to the external system failed
    #[error("connection failed: {0}")]
    Connection(String),

    /// The call did not answer within its own timeout
    #[error("call timed out: {0}")]
    Timeout(String),

    /// The external system refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Target, request or executable not found
    #[error("not found: {0}")]
    NotFound(String),

    /// The response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Local I/O failure (process spawn, pipes)
    #[error("I/O error: {0}")]
    Io(String),
}

impl ControlError {
    /// Whether a retry of the same call may succeed
    ///
    /// Busy, conflict, throttling, connection and per-call timeout failures
    /// are transient. Everything else needs a different request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControlError::Busy(_)
                | ControlError::Conflict(_)
                | ControlError::Throttled(_)
                | ControlError::Connection(_)
                | ControlError::Timeout(_)
        )
    }

    /// Whether the server turned the call away without acting on it
    ///
    /// Only these failures are safe to retry for calls that change a
    /// node. A timeout or dropped connection may hide an accepted request.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            ControlError::Busy(_) | ControlError::Conflict(_) | ControlError::Throttled(_)
        )
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ControlError::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => ControlError::Timeout(err.to_string()),
            _ => ControlError::Io(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ControlError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ControlError::Connection(err.to_string())
        } else if err.is_decode() {
            ControlError::InvalidResponse(err.to_string())
        } else {
            ControlError::Rejected(err.to_string())
        }
    }
}

/// Result type for client calls
pub type Result<T> = std::result::Result<T, ControlError>;
