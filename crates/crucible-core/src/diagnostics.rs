//! Diagnostics escalation on terminal failure
//!
//! Best-effort: sink errors are logged and dropped, and never change the
//! outcome of the step that escalated.

use crate::context::StepContext;
use crate::error::StepError;
use chrono::TimeDelta;
use crucible_control::{DiagnosticsRequest, DiagnosticsSink, RequestId};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default window of data collected before the failure
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(2 * 60 * 60);

/// A target that reached a terminal failure
#[derive(Debug)]
pub struct TargetFailure {
    pub target_id: String,
    /// Request that failed, used as the correlation id
    pub request_id: Option<RequestId>,
    pub error: StepError,
}

impl TargetFailure {
    pub fn new(target_id: impl Into<String>, request_id: Option<RequestId>, error: StepError) -> Self {
        Self {
            target_id: target_id.into(),
            request_id,
            error,
        }
    }
}

impl std::fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.target_id, self.error)
    }
}

/// Issues diagnostics requests for failed targets
#[derive(Clone)]
pub struct DiagnosticsEscalation {
    sink: Arc<dyn DiagnosticsSink>,
    lookback: Duration,
}

impl DiagnosticsEscalation {
    pub fn new(sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            sink,
            lookback: DEFAULT_LOOKBACK,
        }
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Request diagnostics for every failed target
    ///
    /// Does nothing when diagnostics are disabled for the experiment.
    /// Returns the number of requests the sink accepted.
    pub async fn escalate(
        &self,
        ctx: &StepContext,
        issue_type: &str,
        failures: &[TargetFailure],
    ) -> usize {
        if !ctx.diagnostics_enabled() || failures.is_empty() {
            return 0;
        }

        let window_end = ctx.now();
        let lookback = TimeDelta::from_std(self.lookback).unwrap_or(TimeDelta::MAX);
        let window_start = window_end.checked_sub_signed(lookback).unwrap_or(window_end);

        let requests = failures.iter().map(|failure| {
            let mut metadata = BTreeMap::new();
            metadata.insert("target".to_string(), failure.target_id.clone());
            metadata.insert("step".to_string(), ctx.step_id().to_string());
            metadata.insert("reason".to_string(), failure.error.to_string());
            if let Some(request_id) = &failure.request_id {
                metadata.insert("correlation_id".to_string(), request_id.to_string());
            }

            let request = DiagnosticsRequest {
                experiment_id: ctx.experiment_id().to_string(),
                issue_type: issue_type.to_string(),
                window_start,
                window_end,
                metadata,
            };

            let sink = self.sink.clone();
            async move {
                let target = failure.target_id.as_str();
                match sink.request(request).await {
                    Ok(()) => {
                        info!(target = target, issue = issue_type, "Diagnostics escalated");
                        true
                    }
                    Err(e) => {
                        warn!(
                            target = target,
                            issue = issue_type,
                            error = %e,
                            "Diagnostics escalation failed, continuing"
                        );
                        false
                    }
                }
            }
        });

        join_all(requests)
            .await
            .into_iter()
            .filter(|accepted| *accepted)
            .count()
    }
}

impl std::fmt::Debug for DiagnosticsEscalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsEscalation")
            .field("lookback", &self.lookback)
            .finish_non_exhaustive()
    }
}
