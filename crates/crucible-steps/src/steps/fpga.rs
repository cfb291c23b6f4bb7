//! FPGA image flashing

use super::command::{
    default_host, default_success_exit_codes, default_tool_timeout_secs, validate_exit_codes,
    CommandInvocation,
};
use super::{require_non_empty, ProcessWiring};
use async_trait::async_trait;
use crucible_control::ProcessSpec;
use crucible_core::{
    CancellationToken, ExecutionResult, Result, Step, StepContext, StepDefinition,
    StepDependencies, StepParameters,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_tool() -> String {
    "fpga-flash".to_string()
}

/// Parameters of `flash-fpga`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlashFpgaParameters {
    /// Vendor flash tool
    #[serde(default = "default_tool")]
    pub tool: String,

    /// Image file passed to the tool
    pub image: String,

    /// Configuration slot; the tool's default slot when unset
    #[serde(default)]
    pub slot: Option<u8>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Appended after the image and slot arguments
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_success_exit_codes")]
    pub success_exit_codes: Vec<i32>,

    #[serde(default)]
    pub busy_exit_codes: Vec<i32>,
}

impl FlashFpgaParameters {
    fn args(&self) -> Vec<String> {
        let mut args = vec!["--image".to_string(), self.image.clone()];
        if let Some(slot) = self.slot {
            args.push("--slot".to_string());
            args.push(slot.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl StepParameters for FlashFpgaParameters {
    fn validate(&self) -> Result<()> {
        require_non_empty("tool", &self.tool)?;
        require_non_empty("image", &self.image)?;
        require_non_empty("host", &self.host)?;
        validate_exit_codes(&self.success_exit_codes, &self.busy_exit_codes)
    }
}

/// Flash an FPGA image with the vendor tool
pub struct FlashFpgaStep {
    parameters: FlashFpgaParameters,
    invocation: CommandInvocation,
    wiring: ProcessWiring,
}

impl FlashFpgaStep {
    pub const TYPE: &'static str = "flash-fpga";

    pub fn from_definition(definition: &StepDefinition) -> Result<Self> {
        let parameters: FlashFpgaParameters = definition.parameters()?;

        let mut spec = ProcessSpec::new(
            parameters.tool.as_str(),
            Duration::from_secs(parameters.tool_timeout_secs),
        )
        .with_args(parameters.args());
        if let Some(dir) = &parameters.working_dir {
            spec = spec.with_working_dir(dir.clone());
        }

        let invocation = CommandInvocation::new(definition, "fpga", spec, parameters.host.as_str())
            .with_exit_codes(
                parameters.success_exit_codes.clone(),
                parameters.busy_exit_codes.clone(),
            );

        Ok(Self {
            parameters,
            invocation,
            wiring: ProcessWiring::default(),
        })
    }

    pub fn build(definition: &StepDefinition) -> Result<Box<dyn Step>> {
        Ok(Box::new(Self::from_definition(definition)?))
    }

    pub fn parameters(&self) -> &FlashFpgaParameters {
        &self.parameters
    }
}

#[async_trait]
impl Step for FlashFpgaStep {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn description(&self) -> &str {
        "Flash an FPGA image with the vendor tool"
    }

    fn timeout(&self) -> Duration {
        self.invocation.step_timeout
    }

    fn configure(&mut self, deps: &StepDependencies) -> Result<()> {
        self.wiring.configure(deps)
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let (runner, escalation) = self.wiring.get(Self::TYPE)?;
        self.invocation
            .tick(runner.as_ref(), ctx, cancel, escalation)
            .await
    }
}
