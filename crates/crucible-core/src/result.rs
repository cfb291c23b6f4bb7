//! Tick results returned to the scheduler

use crate::error::StepError;
use serde::{Deserialize, Serialize};

/// Status of a step after one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    /// Waiting on an external system; tick again after the normal interval
    InProgress,
    /// Next tick only inspects local state; tick again without delay
    InProgressContinue,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::InProgress => write!(f, "in-progress"),
            ExecutionStatus::InProgressContinue => write!(f, "in-progress-continue"),
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a single tick
///
/// Never persisted. `error` is set for `Failed` results.
#[derive(Debug)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub error: Option<StepError>,
}

impl ExecutionResult {
    pub fn in_progress() -> Self {
        Self {
            status: ExecutionStatus::InProgress,
            error: None,
        }
    }

    pub fn in_progress_continue() -> Self {
        Self {
            status: ExecutionStatus::InProgressContinue,
            error: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            error: None,
        }
    }

    pub fn failed(error: StepError) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}
