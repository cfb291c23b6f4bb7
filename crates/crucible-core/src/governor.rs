//! Wall-clock deadlines
//!
//! A deadline is fixed when it is created (start time plus configured
//! limit) and is never extended. The whole-step deadline and every
//! per-target request deadline are instances of the same type.

use crate::error::{Result, StepError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a deadline governs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeoutScope {
    /// The whole step
    Step,
    /// One target's request
    Target(String),
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutScope::Step => write!(f, "step"),
            TimeoutScope::Target(target) => write!(f, "request for {}", target),
        }
    }
}

/// An absolute expiry time derived once from a start time and a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Deadline {
    /// Compute a deadline `limit` after `started_at`
    pub fn starting_at(started_at: DateTime<Utc>, limit: Duration) -> Self {
        let delta = TimeDelta::from_std(limit).unwrap_or(TimeDelta::MAX);
        let expires_at = started_at
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            started_at,
            expires_at,
        }
    }

    /// Rebuild a deadline from persisted timestamps
    pub fn from_parts(started_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            expires_at,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Configured limit
    pub fn limit(&self) -> Duration {
        to_std(self.expires_at - self.started_at)
    }

    /// Time since the deadline was created
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        to_std(now - self.started_at)
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        to_std(self.expires_at - now)
    }

    /// Expired strictly after `expires_at`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Fail with a `Timeout` error once expired
    pub fn check(&self, now: DateTime<Utc>, scope: TimeoutScope) -> Result<()> {
        if !self.is_expired(now) {
            return Ok(());
        }

        Err(StepError::Timeout {
            scope,
            deadline: self.expires_at,
            elapsed: self.elapsed(now),
            limit: self.limit(),
        })
    }
}

/// Negative deltas clamp to zero
fn to_std(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}
