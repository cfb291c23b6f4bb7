//! In-memory clients for testing
//!
//! These implementations record every call and answer from a script, so
//! step behaviour can be driven tick by tick without a control plane or
//! real hardware.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::diagnostics::{DiagnosticsRequest, DiagnosticsSink};
use crate::error::{ControlError, Result};
use crate::isolation::NodeIsolationClient;
use crate::process::{ProcessOutput, ProcessRunner, ProcessSpec};
use crate::types::{ChangeRequest, ChangeStatus, NodeStatus, PowerAction, RequestId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A call observed by [`ScriptedIsolationClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationCall {
    ApplyChange { target: String, request: ChangeRequest },
    GetChangeStatus { target: String, request_id: RequestId },
    IsChangeFailed { target: String, request_id: RequestId },
    SetPowerState { target: String, action: PowerAction },
    GetNodeStatus { target: String, request_id: RequestId },
}

#[derive(Debug, Default)]
struct IsolationScript {
    next_id: u64,
    calls: Vec<IsolationCall>,
    statuses: HashMap<String, ChangeStatus>,
    issue_errors: HashMap<String, VecDeque<ControlError>>,
    unconfirmed_failures: HashSet<String>,
}

/// Scripted node-isolation control plane
///
/// Every target reports `Pending` until a status is scripted with
/// [`set_status`](Self::set_status). The scripted status applies to any
/// request for that target, including reissued ones.
#[derive(Debug, Default)]
pub struct ScriptedIsolationClient {
    script: Mutex<IsolationScript>,
}

impl ScriptedIsolationClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status reported for every request of `target` from now on
    pub fn set_status(&self, target: &str, status: ChangeStatus) {
        lock(&self.script)
            .statuses
            .insert(target.to_string(), status);
    }

    /// Make the next issuance call for `target` fail with `error`
    pub fn fail_next_issue(&self, target: &str, error: ControlError) {
        lock(&self.script)
            .issue_errors
            .entry(target.to_string())
            .or_default()
            .push_back(error);
    }

    /// Make `is_change_failed` deny failures reported for `target`
    pub fn leave_failure_unconfirmed(&self, target: &str) {
        lock(&self.script)
            .unconfirmed_failures
            .insert(target.to_string());
    }

    /// All calls in the order they were made
    pub fn calls(&self) -> Vec<IsolationCall> {
        lock(&self.script).calls.clone()
    }

    /// Targets of `apply_change` calls, in call order
    pub fn applied_targets(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                IsolationCall::ApplyChange { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    /// Targets of `set_power_state` calls, in call order
    pub fn powered_targets(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                IsolationCall::SetPowerState { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    /// Number of side-effecting calls (`apply_change` and `set_power_state`)
    pub fn issue_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    IsolationCall::ApplyChange { .. } | IsolationCall::SetPowerState { .. }
                )
            })
            .count()
    }

    fn issue(&self, target: &str, call: IsolationCall) -> Result<RequestId> {
        let mut script = lock(&self.script);
        script.calls.push(call);

        if let Some(error) = script
            .issue_errors
            .get_mut(target)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        script.next_id += 1;
        Ok(RequestId::new(format!("{}-req-{}", target, script.next_id)))
    }

    fn status_of(&self, target: &str) -> ChangeStatus {
        lock(&self.script)
            .statuses
            .get(target)
            .cloned()
            .unwrap_or_else(ChangeStatus::pending)
    }
}

#[async_trait]
impl NodeIsolationClient for ScriptedIsolationClient {
    async fn apply_change(&self, target: &str, request: &ChangeRequest) -> Result<RequestId> {
        self.issue(
            target,
            IsolationCall::ApplyChange {
                target: target.to_string(),
                request: request.clone(),
            },
        )
    }

    async fn get_change_status(
        &self,
        target: &str,
        request_id: &RequestId,
    ) -> Result<ChangeStatus> {
        lock(&self.script).calls.push(IsolationCall::GetChangeStatus {
            target: target.to_string(),
            request_id: request_id.clone(),
        });
        Ok(self.status_of(target))
    }

    async fn is_change_failed(&self, target: &str, request_id: &RequestId) -> Result<bool> {
        lock(&self.script).calls.push(IsolationCall::IsChangeFailed {
            target: target.to_string(),
            request_id: request_id.clone(),
        });

        let unconfirmed = lock(&self.script).unconfirmed_failures.contains(target);
        Ok(!unconfirmed && self.status_of(target).is_failure())
    }

    async fn set_power_state(&self, target: &str, action: PowerAction) -> Result<RequestId> {
        self.issue(
            target,
            IsolationCall::SetPowerState {
                target: target.to_string(),
                action,
            },
        )
    }

    async fn get_node_status(&self, target: &str, request_id: &RequestId) -> Result<NodeStatus> {
        lock(&self.script).calls.push(IsolationCall::GetNodeStatus {
            target: target.to_string(),
            request_id: request_id.clone(),
        });

        let status = self.status_of(target);
        Ok(NodeStatus::new(format!(
            "node {} request {}: {:?}",
            target, request_id, status.state
        )))
    }
}

/// Scripted hardware process runner
///
/// Answers are consumed in order; once the script is exhausted every run
/// exits with code 0 and no output.
#[derive(Debug, Default)]
pub struct ScriptedProcessRunner {
    answers: Mutex<VecDeque<Result<ProcessOutput>>>,
    runs: Mutex<Vec<ProcessSpec>>,
}

impl ScriptedProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_output(&self, output: ProcessOutput) {
        lock(&self.answers).push_back(Ok(output));
    }

    pub fn push_error(&self, error: ControlError) {
        lock(&self.answers).push_back(Err(error));
    }

    pub fn runs(&self) -> Vec<ProcessSpec> {
        lock(&self.runs).clone()
    }

    pub fn run_count(&self) -> usize {
        lock(&self.runs).len()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedProcessRunner {
    async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput> {
        lock(&self.runs).push(spec.clone());
        lock(&self.answers)
            .pop_front()
            .unwrap_or_else(|| Ok(ProcessOutput::new(0)))
    }
}

/// Diagnostics sink that keeps every request
#[derive(Debug, Default)]
pub struct RecordingDiagnosticsSink {
    requests: Mutex<Vec<DiagnosticsRequest>>,
    unavailable: bool,
}

impl RecordingDiagnosticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that records requests but reports every hand-over as failed
    pub fn unavailable() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            unavailable: true,
        }
    }

    pub fn requests(&self) -> Vec<DiagnosticsRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl DiagnosticsSink for RecordingDiagnosticsSink {
    async fn request(&self, request: DiagnosticsRequest) -> Result<()> {
        lock(&self.requests).push(request);
        if self.unavailable {
            return Err(ControlError::Connection("diagnostics service unavailable".into()));
        }
        Ok(())
    }
}
