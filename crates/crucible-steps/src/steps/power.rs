//! Power state changes
//!
//! Asks the control plane to change the power state of every listed node
//! and waits for each request to settle. The node status blob reported
//! after a settled request is kept as the step's last output.

use super::{validate_targets, IsolationWiring};
use async_trait::async_trait;
use crucible_control::{ChangeStatus, NodeIsolationClient, PowerAction, RequestId};
use crucible_core::{
    CancellationToken, DistributedOperation, ExecutionResult, FanOutTracker, Result, Step,
    StepContext, StepDefinition, StepDependencies, StepParameters, TrackerSettings,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn default_action() -> PowerAction {
    PowerAction::Cycle
}

/// Parameters of `power-cycle`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerCycleParameters {
    /// Target nodes
    pub nodes: Vec<String>,

    /// Power action, `cycle` unless configured
    #[serde(default = "default_action")]
    pub action: PowerAction,
}

impl StepParameters for PowerCycleParameters {
    fn validate(&self) -> Result<()> {
        validate_targets(&self.nodes)
    }
}

struct PowerOperation {
    client: Arc<dyn NodeIsolationClient>,
    action: PowerAction,
}

#[async_trait]
impl DistributedOperation for PowerOperation {
    fn issue_type(&self) -> &str {
        "power"
    }

    async fn issue(&self, target: &str) -> crucible_control::Result<RequestId> {
        self.client.set_power_state(target, self.action).await
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

    async fn describe(&self, target: &str, request_id: &RequestId) -> Option<String> {
        match self.client.get_node_status(target, request_id).await {
            Ok(status) => {
                debug!(target = target, status = status.headline(), "Node status");
                Some(format!("{}: {}", target, status.as_str()))
            }
            Err(e) => {
                debug!(target = target, error = %e, "Node status unavailable");
                None
            }
        }
    }
}

/// Change the power state of a set of nodes
pub struct PowerCycleStep {
    parameters: PowerCycleParameters,
    tracker: FanOutTracker,
    wiring: IsolationWiring,
}

impl PowerCycleStep {
    pub const TYPE: &'static str = "power-cycle";

    pub fn from_definition(definition: &StepDefinition) -> Result<Self> {
        let parameters: PowerCycleParameters = definition.parameters()?;
        let settings = TrackerSettings::from_definition(definition, parameters.nodes.clone());

        Ok(Self {
            parameters,
            tracker: FanOutTracker::new(settings),
            wiring: IsolationWiring::default(),
        })
    }

    /// Registry constructor
    pub fn build(definition: &StepDefinition) -> Result<Box<dyn Step>> {
        Ok(Box::new(Self::from_definition(definition)?))
    }

    pub fn parameters(&self) -> &PowerCycleParameters {
        &self.parameters
    }
}

#[async_trait]
impl Step for PowerCycleStep {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn description(&self) -> &str {
        "Change the power state of a set of nodes"
    }

    fn timeout(&self) -> Duration {
        self.tracker.settings().step_timeout
    }

    fn configure(&mut self, deps: &StepDependencies) -> Result<()> {
        self.wiring.configure(deps)
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let (client, escalation) = self.wiring.get(Self::TYPE)?;
        let operation = PowerOperation {
            client: client.clone(),
            action: self.parameters.action,
        };

        self.tracker.tick(&operation, ctx, cancel, escalation).await
    }
}
