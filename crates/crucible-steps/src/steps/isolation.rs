//! Network isolation rules

use super::{require_non_empty, validate_targets, ChangeOperation, IsolationWiring};
use async_trait::async_trait;
use crucible_control::{ChangeKind, ChangeRequest};
use crucible_core::{
    CancellationToken, ExecutionResult, FanOutTracker, Result, Step, StepContext,
    StepDefinition, StepDependencies, StepError, StepParameters, TrackerSettings,
};
use serde::Deserialize;
use std::time::Duration;

/// Parameters of `apply-isolation`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IsolationParameters {
    /// Target nodes
    pub nodes: Vec<String>,

    /// Firewall rules, applied in order
    pub rules: Vec<String>,

    /// Named rule profile on the control plane
    #[serde(default)]
    pub profile: Option<String>,
}

impl StepParameters for IsolationParameters {
    fn validate(&self) -> Result<()> {
        validate_targets(&self.nodes)?;
        if self.rules.is_empty() {
            return Err(StepError::Configuration("rules must not be empty".to_string()));
        }
        for rule in &self.rules {
            require_non_empty("rule", rule)?;
        }
        if let Some(profile) = &self.profile {
            require_non_empty("profile", profile)?;
        }
        Ok(())
    }
}

/// Apply network isolation (firewall) rules to a set of nodes
pub struct ApplyIsolationStep {
    parameters: IsolationParameters,
    tracker: FanOutTracker,
    wiring: IsolationWiring,
}

impl ApplyIsolationStep {
    pub const TYPE: &'static str = "apply-isolation";

    pub fn from_definition(definition: &StepDefinition) -> Result<Self> {
        let parameters: IsolationParameters = definition.parameters()?;
        let settings = TrackerSettings::from_definition(definition, parameters.nodes.clone());

        Ok(Self {
            parameters,
            tracker: FanOutTracker::new(settings),
            wiring: IsolationWiring::default(),
        })
    }

    pub fn build(definition: &StepDefinition) -> Result<Box<dyn Step>> {
        Ok(Box::new(Self::from_definition(definition)?))
    }

    pub fn parameters(&self) -> &IsolationParameters {
        &self.parameters
    }

    fn change_request(&self) -> ChangeRequest {
        let request = ChangeRequest::new(ChangeKind::Firewall)
            .with_parameter("rules", self.parameters.rules.join("\n"));

        match &self.parameters.profile {
            Some(profile) => request.with_parameter("profile", profile.as_str()),
            None => request,
        }
    }
}

#[async_trait]
impl Step for ApplyIsolationStep {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn description(&self) -> &str {
        "Apply network isolation (firewall) rules to a set of nodes"
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
        let operation = ChangeOperation::new("isolation", client.clone(), self.change_request());

        self.tracker.tick(&operation, ctx, cancel, escalation).await
    }
}
