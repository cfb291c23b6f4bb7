//! Persisted step state
//!
//! `StepState` is the only thing a step remembers between ticks. It is
//! written as camelCase JSON so the record stays readable when inspected
//! in the state store.

use crate::error::{Result, StepError};
use crate::governor::Deadline;
use chrono::{DateTime, Utc};
use crucible_control::RequestId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Resumption state of one step instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// An external side-effecting call has been issued and is outstanding
    pub requested: bool,

    /// The operation has been verified complete
    pub completed: bool,

    /// Whole-operation attempts, distinct from transient-call retries
    #[serde(default)]
    pub attempt: u32,

    pub created_at: DateTime<Utc>,

    /// Fixed on the first tick, never recomputed
    pub deadline: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,

    /// One descriptor per fan-out target, in issuance order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<RequestDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Terminal failure message, set once the step has failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl StepState {
    /// Fresh state whose deadline is `timeout` after `now`
    pub fn new(now: DateTime<Utc>, timeout: Duration) -> Self {
        let deadline = Deadline::starting_at(now, timeout);

        Self {
            requested: false,
            completed: false,
            attempt: 0,
            created_at: deadline.started_at(),
            deadline: deadline.expires_at(),
            last_output: None,
            requests: Vec::new(),
            exit_code: None,
            failure: None,
        }
    }

    pub fn step_deadline(&self) -> Deadline {
        Deadline::from_parts(self.created_at, self.deadline)
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn request(&self, target: &str) -> Option<&RequestDescriptor> {
        self.requests.iter().find(|r| r.target_id == target)
    }

    pub fn request_mut(&mut self, target: &str) -> Option<&mut RequestDescriptor> {
        self.requests.iter_mut().find(|r| r.target_id == target)
    }

    /// Append a descriptor for a target that has none
    pub fn insert_request(&mut self, descriptor: RequestDescriptor) -> Result<()> {
        if self.request(&descriptor.target_id).is_some() {
            return Err(StepError::InvalidState(format!(
                "duplicate request descriptor for target {}",
                descriptor.target_id
            )));
        }

        self.requests.push(descriptor);
        self.requested = true;
        Ok(())
    }

    /// Drop one target's descriptor so it is reissued on a later tick
    pub fn reset_request(&mut self, target: &str) -> Option<RequestDescriptor> {
        let index = self.requests.iter().position(|r| r.target_id == target)?;
        let removed = self.requests.remove(index);

        if self.requests.is_empty() {
            self.requested = false;
        }
        Some(removed)
    }

    /// Whether every descriptor has been verified
    pub fn all_verified(&self) -> bool {
        self.requests.iter().all(|r| r.verified)
    }

    /// Check the invariants shared by every step
    ///
    /// Step kinds add their own checks on top (fan-out steps require
    /// descriptors when `requested` is set, process steps an exit code).
    pub fn validate(&self) -> Result<()> {
        if self.completed && !self.requested {
            return Err(StepError::InvalidState(
                "completed is set but no request was ever issued".to_string(),
            ));
        }

        if !self.requests.is_empty() && !self.requested {
            return Err(StepError::InvalidState(format!(
                "{} request descriptors recorded but requested is not set",
                self.requests.len()
            )));
        }

        let mut seen = HashSet::new();
        for request in &self.requests {
            if !seen.insert(request.target_id.as_str()) {
                return Err(StepError::InvalidState(format!(
                    "duplicate request descriptor for target {}",
                    request.target_id
                )));
            }
        }

        if self.deadline < self.created_at {
            return Err(StepError::InvalidState(format!(
                "deadline {} precedes creation time {}",
                self.deadline, self.created_at
            )));
        }

        Ok(())
    }
}

/// Tracking record for one target of a fan-out request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    pub target_id: String,
    pub request_id: RequestId,
    pub requested_at: DateTime<Utc>,
    pub request_timeout_ms: u64,
    /// Fixed at issuance, never extended
    pub request_deadline: DateTime<Utc>,
    /// The control plane reported terminal success for `request_id`
    #[serde(default)]
    pub verified: bool,
}

impl RequestDescriptor {
    pub fn new(
        target_id: impl Into<String>,
        request_id: RequestId,
        requested_at: DateTime<Utc>,
        request_timeout: Duration,
    ) -> Self {
        let deadline = Deadline::starting_at(requested_at, request_timeout);

        Self {
            target_id: target_id.into(),
            request_id,
            requested_at,
            request_timeout_ms: u64::try_from(request_timeout.as_millis()).unwrap_or(u64::MAX),
            request_deadline: deadline.expires_at(),
            verified: false,
        }
    }

    pub fn deadline(&self) -> Deadline {
        Deadline::from_parts(self.requested_at, self.request_deadline)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    fn descriptor(target: &str) -> RequestDescriptor {
        RequestDescriptor::new(
            target,
            RequestId::new(format!("{}-r", target)),
            t0(),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn test_new_state_fixes_deadline() {
        let state = StepState::new(t0(), Duration::from_secs(20 * 60));

        assert!(!state.requested);
        assert!(!state.completed);
        assert_eq!(state.attempt, 0);
        assert_eq!(state.created_at, t0());
        assert_eq!(state.deadline, t0() + TimeDelta::minutes(20));
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_insert_and_reset_request() {
        let mut state = StepState::new(t0(), Duration::from_secs(3600));

        state.insert_request(descriptor("a")).unwrap();
        state.insert_request(descriptor("b")).unwrap();
        assert!(state.requested);
        assert!(state.insert_request(descriptor("a")).is_err());

        let removed = state.reset_request("a").unwrap();
        assert_eq!(removed.target_id, "a");
        assert!(state.requested);
        assert!(state.request("a").is_none());

        state.reset_request("b");
        assert!(!state.requested);
        assert!(state.reset_request("b").is_none());
    }

    #[test]
    fn test_validate_rejects_completed_without_request() {
        let mut state = StepState::new(t0(), Duration::from_secs(60));
        state.completed = true;

        assert!(matches!(state.validate(), Err(StepError::InvalidState(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_targets() {
        let mut state = StepState::new(t0(), Duration::from_secs(60));
        state.requested = true;
        state.requests = vec![descriptor("a"), descriptor("a")];

        assert!(matches!(state.validate(), Err(StepError::InvalidState(_))));
    }

    #[test]
    fn test_request_deadline_fixed_at_issuance() {
        let request = descriptor("node-1");

        assert_eq!(request.request_timeout_ms, 600_000);
        assert_eq!(request.request_deadline, t0() + TimeDelta::minutes(10));
        assert_eq!(request.deadline().limit(), Duration::from_secs(600));
    }

    #[test]
    fn test_state_json_round_trip_is_exact() {
        let created = t0() + TimeDelta::nanoseconds(123_456_789);
        let mut state = StepState::new(created, Duration::from_millis(1500));
        state.insert_request(descriptor("node-1")).unwrap();
        state.last_output = Some("flash ok".to_string());

        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("exitCode").is_none());

        let back: StepState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.created_at.timestamp_subsec_nanos(), 123_456_789);
    }
}
