//! Microcode deployment
//!
//! Deploys a microcode package to every listed node through the
//! node-isolation control plane and waits until each node reports the
//! deployment finished.

use super::{require_non_empty, validate_targets, ChangeOperation, IsolationWiring};
use async_trait::async_trait;
use crucible_control::{ChangeKind, ChangeRequest};
use crucible_core::{
    CancellationToken, ExecutionResult, FanOutTracker, Result, Step, StepContext,
    StepDefinition, StepDependencies, StepParameters, TrackerSettings,
};
use serde::Deserialize;
use std::time::Duration;

/// Parameters of `deploy-microcode`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MicrocodeParameters {
    /// Target nodes
    pub nodes: Vec<String>,

    /// Package name known to the control plane
    pub package: String,

    /// Microcode revision, e.g. `0x2c`
    pub version: String,
}

impl StepParameters for MicrocodeParameters {
    fn validate(&self) -> Result<()> {
        validate_targets(&self.nodes)?;
        require_non_empty("package", &self.package)?;
        require_non_empty("version", &self.version)
    }
}

/// Deploy a microcode package to a set of nodes
pub struct DeployMicrocodeStep {
    parameters: MicrocodeParameters,
    tracker: FanOutTracker,
    wiring: IsolationWiring,
}

impl DeployMicrocodeStep {
    pub const TYPE: &'static str = "deploy-microcode";

    pub fn from_definition(definition: &StepDefinition) -> Result<Self> {
        let parameters: MicrocodeParameters = definition.parameters()?;
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

    pub fn parameters(&self) -> &MicrocodeParameters {
        &self.parameters
    }

    fn change_request(&self) -> ChangeRequest {
        ChangeRequest::new(ChangeKind::Microcode)
            .with_parameter("package", self.parameters.package.as_str())
            .with_parameter("version", self.parameters.version.as_str())
    }
}

#[async_trait]
impl Step for DeployMicrocodeStep {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn description(&self) -> &str {
        "Deploy a microcode package to a set of nodes"
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
        let operation = ChangeOperation::new("microcode", client.clone(), self.change_request());

        self.tracker.tick(&operation, ctx, cancel, escalation).await
    }
}
