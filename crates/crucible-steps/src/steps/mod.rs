//! Concrete step implementations
//!
//! # Available Steps
//!
//! - `deploy-microcode` - Deploy a microcode package to a set of nodes
//! - `power-cycle` - Change the power state of a set of nodes
//! - `apply-isolation` - Apply network isolation (firewall) rules to a set of nodes
//! - `flash-fpga` - Flash an FPGA image with the vendor tool
//! - `run-command` - Run an arbitrary command on the experiment host

mod command;
mod fpga;
mod isolation;
mod microcode;
mod power;

pub use command::{CommandParameters, RunCommandStep};
pub use fpga::{FlashFpgaParameters, FlashFpgaStep};
pub use isolation::{ApplyIsolationStep, IsolationParameters};
pub use microcode::{DeployMicrocodeStep, MicrocodeParameters};
pub use power::{PowerCycleParameters, PowerCycleStep};

use async_trait::async_trait;
use crucible_control::{ChangeRequest, ChangeStatus, NodeIsolationClient, ProcessRunner, RequestId};
use crucible_core::{DiagnosticsEscalation, DistributedOperation, Result, StepDependencies, StepError};
use std::collections::HashSet;
use std::sync::Arc;

/// Check a fan-out target list: non-empty, no blanks, no duplicates
pub(crate) fn validate_targets(nodes: &[String]) -> Result<()> {
    if nodes.is_empty() {
        return Err(StepError::Configuration("nodes must not be empty".to_string()));
    }

    let mut seen = HashSet::new();
    for node in nodes {
        if node.trim().is_empty() {
            return Err(StepError::Configuration("node names must not be blank".to_string()));
        }
        if !seen.insert(node.as_str()) {
            return Err(StepError::Configuration(format!("node {} listed twice", node)));
        }
    }

    Ok(())
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StepError::Configuration(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Clients wired into a control-plane step by `configure`
#[derive(Clone, Default)]
pub(crate) struct IsolationWiring {
    client: Option<Arc<dyn NodeIsolationClient>>,
    escalation: Option<DiagnosticsEscalation>,
}

impl IsolationWiring {
    pub(crate) fn configure(&mut self, deps: &StepDependencies) -> Result<()> {
        self.client = Some(deps.isolation()?);
        self.escalation = Some(deps.escalation());
        Ok(())
    }

    pub(crate) fn get(
        &self,
        step: &str,
    ) -> Result<(&Arc<dyn NodeIsolationClient>, &DiagnosticsEscalation)> {
        match (&self.client, &self.escalation) {
            (Some(client), Some(escalation)) => Ok((client, escalation)),
            _ => Err(StepError::NotConfigured(format!(
                "{}: configure was not called",
                step
            ))),
        }
    }
}

/// Clients wired into a process step by `configure`
#[derive(Clone, Default)]
pub(crate) struct ProcessWiring {
    runner: Option<Arc<dyn ProcessRunner>>,
    escalation: Option<DiagnosticsEscalation>,
}

impl ProcessWiring {
    pub(crate) fn configure(&mut self, deps: &StepDependencies) -> Result<()> {
        self.runner = Some(deps.process_runner()?);
        self.escalation = Some(deps.escalation());
        Ok(())
    }

    pub(crate) fn get(&self, step: &str) -> Result<(&Arc<dyn ProcessRunner>, &DiagnosticsEscalation)> {
        match (&self.runner, &self.escalation) {
            (Some(runner), Some(escalation)) => Ok((runner, escalation)),
            _ => Err(StepError::NotConfigured(format!(
                "{}: configure was not called",
                step
            ))),
        }
    }
}

/// Sends one change request to every target through the control plane
pub(crate) struct ChangeOperation {
    issue_type: &'static str,
    client: Arc<dyn NodeIsolationClient>,
    request: ChangeRequest,
}

impl ChangeOperation {
    pub(crate) fn new(
        issue_type: &'static str,
        client: Arc<dyn NodeIsolationClient>,
        request: ChangeRequest,
    ) -> Self {
        Self {
            issue_type,
            client,
            request,
        }
    }
}

#[async_trait]
impl DistributedOperation for ChangeOperation {
    fn issue_type(&self) -> &str {
        self.issue_type
    }

    async fn issue(&self, target: &str) -> crucible_control::Result<RequestId> {
        self.client.apply_change(target, &self.request).await
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

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_validate_targets() {
        assert!(validate_targets(&nodes(&["a", "b"])).is_ok());
        assert!(validate_targets(&[]).is_err());
        assert!(validate_targets(&nodes(&["a", " "])).is_err());

        let err = validate_targets(&nodes(&["a", "b", "a"])).unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: node a listed twice");
    }

    #[test]
    fn test_unconfigured_wiring() {
        let wiring = IsolationWiring::default();
        assert!(matches!(
            wiring.get("deploy-microcode"),
            Err(StepError::NotConfigured(_))
        ));

        let mut wiring = ProcessWiring::default();
        assert!(wiring.configure(&StepDependencies::new()).is_err());
        assert!(wiring.get("run-command").is_err());
    }
}
