//! Distributed request tracking
//!
//! A fan-out step sends the same operation to many nodes and tracks each
//! node's request on its own. Issuance and polling run concurrently for
//! all targets; the per-target outcomes are collected first and applied
//! to the state one by one afterwards, so no two sub-operations ever
//! write the same part of the state.
//!
//! Per-target poll rules:
//!
//! | Observation | Action |
//! |-------------|--------|
//! | finished, succeeded | mark verified |
//! | finished, failed, not confirmed | still pending |
//! | confirmed failure, code not retryable | terminal failure |
//! | confirmed failure, retryable, attempts left, request window open | wait |
//! | confirmed failure, retryable, attempts left, window elapsed | reset target, reissue next tick |
//! | confirmed failure, retryable, no attempts left | terminal failure |
//! | pending past the request deadline | terminal timeout |

use crate::config::StepDefinition;
use crate::context::StepContext;
use crate::diagnostics::{DiagnosticsEscalation, TargetFailure};
use crate::error::{Result, StepError};
use crate::governor::TimeoutScope;
use crate::result::ExecutionResult;
use crate::retry::RetryPolicy;
use crate::state::{RequestDescriptor, StepState};
use crate::step::{begin_tick, fail_step, TickStart};
use async_trait::async_trait;
use crucible_control::{ChangeStatus, ControlError, RequestId};
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An operation that can be sent to a node and polled until it settles
#[async_trait]
pub trait DistributedOperation: Send + Sync {
    /// Issue type reported to diagnostics, e.g. `microcode`
    fn issue_type(&self) -> &str;

    /// Send the operation to one target
    async fn issue(&self, target: &str) -> crucible_control::Result<RequestId>;

    /// Current status of a target's request
    async fn poll(
        &self,
        target: &str,
        request_id: &RequestId,
    ) -> crucible_control::Result<ChangeStatus>;

    /// Ask the control plane to confirm a reported failure
    async fn confirm_failure(
        &self,
        target: &str,
        request_id: &RequestId,
    ) -> crucible_control::Result<bool>;

    /// Diagnostic text for a settled request, kept as the step's last output
    async fn describe(&self, target: &str, request_id: &RequestId) -> Option<String> {
        let _ = (target, request_id);
        None
    }
}

/// Tracker configuration, rebuilt from the step definition on every tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    pub targets: Vec<String>,
    pub step_timeout: Duration,
    pub request_timeout: Duration,
    /// Whole-operation attempts per step, first issuance included
    pub max_attempts: u32,
    /// Policy wrapped around every single external call
    pub retry: RetryPolicy,
    /// Result codes of confirmed failures that allow reissuing
    pub retryable_codes: Vec<String>,
}

impl TrackerSettings {
    pub fn from_definition(definition: &StepDefinition, targets: Vec<String>) -> Self {
        Self {
            targets,
            step_timeout: definition.timeout(),
            request_timeout: definition.request_timeout(),
            max_attempts: definition.max_attempts.max(1),
            retry: definition.retry_policy(),
            retryable_codes: definition.retryable_codes.clone(),
        }
    }

    fn is_retryable(&self, code: Option<&str>) -> bool {
        code.is_some_and(|code| self.retryable_codes.iter().any(|c| c == code))
    }
}

/// Result of advancing the tracker by one round of external calls
#[derive(Debug)]
pub enum TrackerOutcome {
    /// Requests were sent for targets that had none
    Issued { issued: usize, deferred: usize },
    /// Requests are still outstanding
    Pending { outstanding: usize, reset: usize },
    /// Every target is verified
    Completed,
    /// At least one target failed terminally
    Failed(Vec<TargetFailure>),
}

/// What one target's poll observed, before any state is touched
#[derive(Debug)]
enum Observation {
    Succeeded { output: Option<String> },
    Pending,
    Unconfirmed,
    ConfirmedFailure {
        code: Option<String>,
        note: Option<String>,
        output: Option<String>,
    },
    Error(StepError),
}

/// Fan-out state machine shared by every multi-node step
#[derive(Debug, Clone)]
pub struct FanOutTracker {
    settings: TrackerSettings,
}

impl FanOutTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Run one complete tick of a fan-out step
    pub async fn tick<O>(
        &self,
        operation: &O,
        ctx: &StepContext,
        cancel: &CancellationToken,
        escalation: &DiagnosticsEscalation,
    ) -> Result<ExecutionResult>
    where
        O: DistributedOperation + ?Sized,
    {
        let mut state = match begin_tick(ctx, cancel, self.settings.step_timeout).await? {
            TickStart::Ready(state) => state,
            TickStart::Finished(result) => return Ok(result),
            TickStart::Expired(mut state, err) => {
                let failures = self.unverified_failures(ctx, &state);
                escalation.escalate(ctx, operation.issue_type(), &failures).await;
                return fail_step(ctx, &mut state, err).await;
            }
        };

        match self.advance(operation, ctx, &mut state).await? {
            TrackerOutcome::Issued { .. } | TrackerOutcome::Pending { .. } => {
                Ok(ExecutionResult::in_progress())
            }
            TrackerOutcome::Completed => {
                state.completed = true;
                ctx.save_state(&state).await?;
                info!(
                    experiment = %ctx.experiment_id(),
                    step = %ctx.step_id(),
                    targets = self.settings.targets.len(),
                    "All targets verified"
                );
                Ok(ExecutionResult::succeeded())
            }
            TrackerOutcome::Failed(mut failures) => {
                escalation.escalate(ctx, operation.issue_type(), &failures).await;
                let first = failures.remove(0);
                fail_step(ctx, &mut state, first.error).await
            }
        }
    }

    /// Issue for targets without a request, otherwise poll outstanding ones
    ///
    /// Persists every change it makes to `state`.
    pub async fn advance<O>(
        &self,
        operation: &O,
        ctx: &StepContext,
        state: &mut StepState,
    ) -> Result<TrackerOutcome>
    where
        O: DistributedOperation + ?Sized,
    {
        self.check_state(state)?;

        let missing: Vec<String> = self
            .settings
            .targets
            .iter()
            .filter(|target| state.request(target).is_none())
            .cloned()
            .collect();

        if !missing.is_empty() {
            return self.issue_missing(operation, ctx, state, &missing).await;
        }

        self.poll_outstanding(operation, ctx, state).await
    }

    /// Send the operation to every target in `targets` concurrently
    pub async fn issue_missing<O>(
        &self,
        operation: &O,
        ctx: &StepContext,
        state: &mut StepState,
        targets: &[String],
    ) -> Result<TrackerOutcome>
    where
        O: DistributedOperation + ?Sized,
    {
        let retry = self.settings.retry;
        let issue_type = operation.issue_type();

        // Issuance changes the node, so only outright refusals are retried
        let calls = targets.iter().map(|target| async move {
            let result = retry
                .run_when(issue_type, ControlError::is_refusal, || operation.issue(target))
                .await;
            (target, result)
        });
        let results = join_all(calls).await;

        let now = ctx.now();
        let mut issued = 0;
        let mut deferred = 0;
        let mut failures = Vec::new();

        for (target, result) in results {
            match result {
                Ok(request_id) => {
                    info!(
                        experiment = %ctx.experiment_id(),
                        step = %ctx.step_id(),
                        target = %target,
                        request_id = %request_id,
                        attempt = state.attempt + 1,
                        "Request issued"
                    );
                    state.insert_request(RequestDescriptor::new(
                        target.as_str(),
                        request_id,
                        now,
                        self.settings.request_timeout,
                    ))?;
                    issued += 1;
                }
                Err(err @ StepError::RetryExhausted { .. }) => {
                    warn!(
                        step = %ctx.step_id(),
                        target = %target,
                        error = %err,
                        "Issuance deferred to a later tick"
                    );
                    deferred += 1;
                }
                Err(err) => {
                    warn!(step = %ctx.step_id(), target = %target, error = %err, "Issuance rejected");
                    failures.push(TargetFailure::new(target.as_str(), None, err));
                }
            }
        }

        ctx.save_state(state).await?;

        if !failures.is_empty() {
            return Ok(TrackerOutcome::Failed(failures));
        }
        Ok(TrackerOutcome::Issued { issued, deferred })
    }

    /// Poll every unverified request concurrently and apply the results
    pub async fn poll_outstanding<O>(
        &self,
        operation: &O,
        ctx: &StepContext,
        state: &mut StepState,
    ) -> Result<TrackerOutcome>
    where
        O: DistributedOperation + ?Sized,
    {
        let outstanding: Vec<(String, RequestId)> = state
            .requests
            .iter()
            .filter(|request| !request.verified)
            .map(|request| (request.target_id.clone(), request.request_id.clone()))
            .collect();

        let polls = outstanding
            .iter()
            .map(|(target, request_id)| self.observe(operation, target, request_id));
        let observations = join_all(polls).await;

        let now = ctx.now();
        let mut pending = 0;
        let mut reset = 0;
        let mut failures = Vec::new();

        for ((target, request_id), observation) in outstanding.into_iter().zip(observations) {
            let (deadline, attempt) = match state.request(&target) {
                Some(request) => (request.deadline(), state.attempt + 1),
                None => continue,
            };

            match observation {
                Observation::Succeeded { output } => {
                    if let Some(request) = state.request_mut(&target) {
                        request.verified = true;
                    }
                    if output.is_some() {
                        state.last_output = output;
                    }
                    info!(step = %ctx.step_id(), target = %target, request_id = %request_id, "Target verified");
                }
                Observation::Pending | Observation::Unconfirmed => {
                    match deadline.check(now, TimeoutScope::Target(target.clone())) {
                        Ok(()) => pending += 1,
                        Err(err) => failures.push(TargetFailure::new(target, Some(request_id), err)),
                    }
                }
                Observation::ConfirmedFailure { code, note, output } => {
                    if output.is_some() {
                        state.last_output = output;
                    }

                    let message = match (&code, &note) {
                        (Some(code), Some(note)) => format!("{}: {}", code, note),
                        (Some(code), None) => code.clone(),
                        (None, Some(note)) => note.clone(),
                        (None, None) => "control plane reported failure".to_string(),
                    };

                    let retryable = self.settings.is_retryable(code.as_deref());
                    let attempts_left = attempt < self.settings.max_attempts;

                    if retryable && attempts_left {
                        if deadline.is_expired(now) {
                            state.attempt += 1;
                            state.reset_request(&target);
                            reset += 1;
                            info!(
                                step = %ctx.step_id(),
                                target = %target,
                                attempt = state.attempt + 1,
                                max = self.settings.max_attempts,
                                reason = %message,
                                "Retryable failure, target will be reissued"
                            );
                        } else {
                            debug!(
                                step = %ctx.step_id(),
                                target = %target,
                                reason = %message,
                                "Retryable failure, waiting for request window"
                            );
                            pending += 1;
                        }
                        continue;
                    }

                    let error = StepError::VerifiedFailure {
                        target: target.clone(),
                        request_id: Some(request_id.to_string()),
                        message,
                        attempt,
                        max_attempts: self.settings.max_attempts,
                    };
                    failures.push(TargetFailure::new(target, Some(request_id), error));
                }
                Observation::Error(err @ StepError::RetryExhausted { .. }) => {
                    warn!(step = %ctx.step_id(), target = %target, error = %err, "Status poll failed");
                    match deadline.check(now, TimeoutScope::Target(target.clone())) {
                        Ok(()) => pending += 1,
                        Err(timeout) => {
                            failures.push(TargetFailure::new(target, Some(request_id), timeout))
                        }
                    }
                }
                Observation::Error(err) => {
                    failures.push(TargetFailure::new(target, Some(request_id), err));
                }
            }
        }

        ctx.save_state(state).await?;

        if !failures.is_empty() {
            return Ok(TrackerOutcome::Failed(failures));
        }

        let all_verified = self
            .settings
            .targets
            .iter()
            .all(|target| state.request(target).is_some_and(|r| r.verified));
        if all_verified {
            return Ok(TrackerOutcome::Completed);
        }

        Ok(TrackerOutcome::Pending {
            outstanding: pending,
            reset,
        })
    }

    async fn observe<O>(&self, operation: &O, target: &str, request_id: &RequestId) -> Observation
    where
        O: DistributedOperation + ?Sized,
    {
        let retry = self.settings.retry;

        let status = match retry
            .run("get_change_status", || operation.poll(target, request_id))
            .await
        {
            Ok(status) => status,
            Err(err) => return Observation::Error(err),
        };

        if !status.is_finished() {
            return Observation::Pending;
        }

        if status.is_success() {
            let output = operation.describe(target, request_id).await;
            return Observation::Succeeded { output };
        }

        match retry
            .run("is_change_failed", || operation.confirm_failure(target, request_id))
            .await
        {
            Ok(true) => Observation::ConfirmedFailure {
                code: status.result_code,
                note: status.note,
                output: operation.describe(target, request_id).await,
            },
            Ok(false) => Observation::Unconfirmed,
            Err(err) => Observation::Error(err),
        }
    }

    /// Fan-out invariants on top of [`StepState::validate`]
    fn check_state(&self, state: &StepState) -> Result<()> {
        if state.requested && state.requests.is_empty() {
            return Err(StepError::InvalidState(
                "requested is set but no request descriptors are recorded".to_string(),
            ));
        }

        let targets: HashSet<&str> = self.settings.targets.iter().map(String::as_str).collect();
        if let Some(stray) = state
            .requests
            .iter()
            .find(|r| !targets.contains(r.target_id.as_str()))
        {
            return Err(StepError::InvalidState(format!(
                "request descriptor for unknown target {}",
                stray.target_id
            )));
        }

        Ok(())
    }

    /// Timeout failures for every target not yet verified
    fn unverified_failures(&self, ctx: &StepContext, state: &StepState) -> Vec<TargetFailure> {
        let now = ctx.now();
        let deadline = state.step_deadline();

        self.settings
            .targets
            .iter()
            .filter_map(|target| {
                let request = state.request(target);
                if request.is_some_and(|r| r.verified) {
                    return None;
                }

                Some(TargetFailure::new(
                    target.as_str(),
                    request.map(|r| r.request_id.clone()),
                    StepError::Timeout {
                        scope: TimeoutScope::Step,
                        deadline: deadline.expires_at(),
                        elapsed: deadline.elapsed(now),
                        limit: deadline.limit(),
                    },
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::result::ExecutionStatus;
    use crate::store::{MemoryStateStore, StateStore};
    use chrono::{TimeZone, Utc};
    use crucible_control::{
        ChangeKind, ChangeRequest, ControlError, NodeIsolationClient, RecordingDiagnosticsSink,
        ScriptedIsolationClient,
    };
    use std::sync::Arc;

    struct ApplyOperation {
        client: Arc<ScriptedIsolationClient>,
    }

    #[async_trait]
    impl DistributedOperation for ApplyOperation {
        fn issue_type(&self) -> &str {
            "microcode"
        }

        async fn issue(&self, target: &str) -> crucible_control::Result<RequestId> {
            self.client
                .apply_change(target, &ChangeRequest::new(ChangeKind::Microcode))
                .await
        }

        async fn poll(
            &self,
            target: &str,
            request_id: &RequestId,
        ) -> crucible_control::Result<ChangeStatus> {
            self.client.get_change_status(target, request_id).await
        }

        async fn confirm_failure(
            &self,
            target: &str,
            request_id: &RequestId,
        ) -> crucible_control::Result<bool> {
            self.client.is_change_failed(target, request_id).await
        }
    }

    struct Harness {
        client: Arc<ScriptedIsolationClient>,
        sink: Arc<RecordingDiagnosticsSink>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStateStore>,
        tracker: FanOutTracker,
        operation: ApplyOperation,
        escalation: DiagnosticsEscalation,
        diagnostics: bool,
    }

    impl Harness {
        fn new(targets: &[&str]) -> Self {
            let client = Arc::new(ScriptedIsolationClient::new());
            let sink = Arc::new(RecordingDiagnosticsSink::new());

            let settings = TrackerSettings {
                targets: targets.iter().map(|t| t.to_string()).collect(),
                step_timeout: Duration::from_secs(20 * 60),
                request_timeout: Duration::from_secs(5 * 60),
                max_attempts: 3,
                retry: RetryPolicy::new(2, 2).with_backoff_unit(Duration::from_millis(1)),
                retryable_codes: vec!["NodeBusy".to_string()],
            };

            Self {
                operation: ApplyOperation {
                    client: client.clone(),
                },
                escalation: DiagnosticsEscalation::new(sink.clone()),
                client,
                sink,
                clock: Arc::new(ManualClock::new(
                    Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap(),
                )),
                store: Arc::new(MemoryStateStore::new()),
                tracker: FanOutTracker::new(settings),
                diagnostics: true,
            }
        }

        fn context(&self) -> StepContext {
            StepContext::new("exp-1", "deploy", self.store.clone())
                .with_clock(self.clock.clone())
                .with_diagnostics(self.diagnostics)
        }

        async fn tick(&self) -> Result<ExecutionResult> {
            self.tracker
                .tick(
                    &self.operation,
                    &self.context(),
                    &CancellationToken::new(),
                    &self.escalation,
                )
                .await
        }

        async fn state(&self) -> StepState {
            self.context().load_state().await.unwrap().unwrap()
        }

        fn minutes(&self, minutes: u64) {
            self.clock.advance(Duration::from_secs(minutes * 60));
        }
    }

    #[tokio::test]
    async fn test_issue_then_poll_to_success() {
        let h = Harness::new(&["a", "b"]);

        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::InProgress);
        assert_eq!(h.client.issue_count(), 2);

        let state = h.state().await;
        assert!(state.requested);
        assert_eq!(state.requests.len(), 2);

        h.client.set_status("a", ChangeStatus::succeeded());
        h.client.set_status("b", ChangeStatus::succeeded());
        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert!(h.state().await.completed);
    }

    #[tokio::test]
    async fn test_idempotent_issuance() {
        let h = Harness::new(&["a", "b", "c"]);

        h.tick().await.unwrap();
        h.tick().await.unwrap();
        h.tick().await.unwrap();

        assert_eq!(h.client.issue_count(), 3);
        assert!(h.state().await.requested);
    }

    #[tokio::test]
    async fn test_partial_issuance_keeps_successful_targets() {
        let h = Harness::new(&["a", "b", "c"]);
        h.client.fail_next_issue("b", ControlError::Busy("locked".into()));
        h.client.fail_next_issue("b", ControlError::Busy("locked".into()));

        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::InProgress);

        let state = h.state().await;
        assert!(state.request("a").is_some());
        assert!(state.request("b").is_none());
        assert!(state.request("c").is_some());

        // Only b is issued on the next tick
        h.tick().await.unwrap();
        assert_eq!(h.client.applied_targets().iter().filter(|t| *t == "b").count(), 3);
        assert_eq!(h.client.applied_targets().iter().filter(|t| *t == "a").count(), 1);
        assert!(h.state().await.request("b").is_some());
    }

    #[tokio::test]
    async fn test_fan_out_independence() {
        let h = Harness::new(&["a", "b", "c"]);
        h.tick().await.unwrap();

        h.client.set_status("a", ChangeStatus::succeeded());
        h.client.set_status("b", ChangeStatus::failed("NodeBusy"));
        h.client.set_status("c", ChangeStatus::succeeded());

        // Request window still open: b waits
        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::InProgress);
        assert!(h.state().await.request("b").is_some());

        // Window elapsed: only b is reset
        h.minutes(6);
        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::InProgress);

        let state = h.state().await;
        assert_eq!(state.attempt, 1);
        assert!(state.request("a").unwrap().verified);
        assert!(state.request("c").unwrap().verified);
        assert!(state.request("b").is_none());

        // Next tick reissues b only
        h.tick().await.unwrap();
        assert_eq!(h.client.applied_targets(), vec!["a", "b", "c", "b"]);

        h.client.set_status("b", ChangeStatus::succeeded());
        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(h.sink.request_count(), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_escalates() {
        let h = Harness::new(&["a", "b"]);
        h.tick().await.unwrap();

        h.client.set_status("a", ChangeStatus::succeeded());
        h.client
            .set_status("b", ChangeStatus::failed("ChecksumMismatch").with_note("bad package"));

        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        match result.error {
            Some(StepError::VerifiedFailure {
                target,
                message,
                attempt,
                max_attempts,
                ..
            }) => {
                assert_eq!(target, "b");
                assert_eq!(message, "ChecksumMismatch: bad package");
                assert_eq!(attempt, 1);
                assert_eq!(max_attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let requests = h.sink.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].metadata("target"), Some("b"));
        assert_eq!(requests[0].metadata("correlation_id"), Some("b-req-2"));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_without_diagnostics() {
        let mut h = Harness::new(&["a"]);
        h.diagnostics = false;
        h.client.set_status("a", ChangeStatus::failed("NodeBusy"));

        for _ in 0..2 {
            h.tick().await.unwrap(); // issue
            h.minutes(6);
            let result = h.tick().await.unwrap(); // reset
            assert_eq!(result.status, ExecutionStatus::InProgress);
        }
        assert_eq!(h.state().await.attempt, 2);

        h.tick().await.unwrap(); // third issuance
        h.minutes(6);
        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(matches!(
            result.error,
            Some(StepError::VerifiedFailure { attempt: 3, max_attempts: 3, .. })
        ));
        assert_eq!(h.client.issue_count(), 3);
        assert_eq!(h.sink.request_count(), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_failure_is_pending() {
        let h = Harness::new(&["a"]);
        h.tick().await.unwrap();

        h.client.set_status("a", ChangeStatus::failed("Broken"));
        h.client.leave_failure_unconfirmed("a");

        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::InProgress);
        assert!(!h.state().await.request("a").unwrap().verified);
    }

    #[tokio::test]
    async fn test_target_request_timeout() {
        let h = Harness::new(&["a", "b"]);
        h.tick().await.unwrap();
        h.client.set_status("a", ChangeStatus::succeeded());

        h.minutes(6);
        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        match result.error {
            Some(StepError::Timeout { scope, .. }) => {
                assert_eq!(scope, TimeoutScope::Target("b".to_string()))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.sink.request_count(), 1);
    }

    #[tokio::test]
    async fn test_step_timeout_precedes_poll() {
        let h = Harness::new(&["a"]);
        h.tick().await.unwrap();
        let polls_before = h.client.calls().len();

        h.client.set_status("a", ChangeStatus::succeeded());
        h.minutes(21);

        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(matches!(
            result.error,
            Some(StepError::Timeout { scope: TimeoutScope::Step, .. })
        ));
        assert_eq!(h.client.calls().len(), polls_before);
        assert_eq!(h.sink.request_count(), 1);

        // Re-tick repeats the failure without calls or escalation
        let result = h.tick().await.unwrap();
        assert!(matches!(result.error, Some(StepError::AlreadyFailed(_))));
        assert_eq!(h.client.calls().len(), polls_before);
        assert_eq!(h.sink.request_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_issuance_fails() {
        let h = Harness::new(&["a"]);
        h.client.fail_next_issue("a", ControlError::Rejected("unknown node".into()));

        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(matches!(
            result.error,
            Some(StepError::Client(ControlError::Rejected(_)))
        ));
        assert_eq!(h.sink.request_count(), 1);
    }

    #[tokio::test]
    async fn test_issuance_timeout_is_not_reissued() {
        let h = Harness::new(&["a", "b"]);
        h.client.fail_next_issue("a", ControlError::Timeout("no response".into()));

        let result = h.tick().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(matches!(
            result.error,
            Some(StepError::Client(ControlError::Timeout(_)))
        ));
        assert_eq!(h.client.applied_targets(), vec!["a", "b"]);

        // The failure is terminal, so a later tick does not try again
        h.tick().await.unwrap();
        assert_eq!(h.client.issue_count(), 2);
    }

    #[tokio::test]
    async fn test_requested_without_descriptors_is_invalid() {
        let h = Harness::new(&["a"]);
        let ctx = h.context();

        let mut state = StepState::new(h.clock.now(), Duration::from_secs(1200));
        state.requested = true;
        h.store
            .set(&ctx.state_key(), &ctx.state_scope(), serde_json::to_value(&state).unwrap())
            .await
            .unwrap();

        let err = h.tick().await.unwrap_err();
        assert!(matches!(err, StepError::InvalidState(_)));
        assert_eq!(h.client.issue_count(), 0);
        assert!(!h.state().await.is_failed());
    }

    #[tokio::test]
    async fn test_descriptor_for_unknown_target_is_invalid() {
        let h = Harness::new(&["a"]);
        let ctx = h.context();

        let mut state = StepState::new(h.clock.now(), Duration::from_secs(1200));
        state
            .insert_request(RequestDescriptor::new(
                "zz",
                RequestId::new("r"),
                h.clock.now(),
                Duration::from_secs(60),
            ))
            .unwrap();
        ctx.save_state(&state).await.unwrap();

        assert!(matches!(h.tick().await, Err(StepError::InvalidState(_))));
    }
}
