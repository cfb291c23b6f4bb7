//! Process steps
//!
//! A process step runs one tool on the experiment host per attempt. The
//! tool's exit code is recorded on the issuing tick and judged on the next
//! one. Once the exit code is persisted the tool is not run again for that
//! attempt; a crash while the tool is still running leaves nothing recorded,
//! so the next tick runs it again.

use super::{require_non_empty, ProcessWiring};
use async_trait::async_trait;
use crucible_control::{ControlError, ProcessOutput, ProcessRunner, ProcessSpec};
use crucible_core::{
    begin_tick, fail_step, CancellationToken, DiagnosticsEscalation, ExecutionResult, Result,
    RetryPolicy, Step, StepContext, StepDefinition, StepDependencies, StepError, StepParameters,
    StepState, TargetFailure, TickStart,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lines of tool output kept as the step's last output
const OUTPUT_TAIL_LINES: usize = 20;

pub(super) fn default_host() -> String {
    "localhost".to_string()
}

pub(super) fn default_tool_timeout_secs() -> u64 {
    1800
}

pub(super) fn default_success_exit_codes() -> Vec<i32> {
    vec![0]
}

pub(super) fn validate_exit_codes(success: &[i32], busy: &[i32]) -> Result<()> {
    if success.is_empty() {
        return Err(StepError::Configuration(
            "success_exit_codes must not be empty".to_string(),
        ));
    }
    if let Some(code) = busy.iter().find(|code| success.contains(code)) {
        return Err(StepError::Configuration(format!(
            "exit code {} is both a success and a busy code",
            code
        )));
    }
    Ok(())
}

/// One tool invocation and the rules for judging its exit code
#[derive(Debug, Clone)]
pub(crate) struct CommandInvocation {
    pub spec: ProcessSpec,
    pub host: String,
    pub success_exit_codes: Vec<i32>,
    pub busy_exit_codes: Vec<i32>,
    pub step_timeout: Duration,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    pub issue_type: &'static str,
}

impl CommandInvocation {
    pub(crate) fn new(
        definition: &StepDefinition,
        issue_type: &'static str,
        spec: ProcessSpec,
        host: impl Into<String>,
    ) -> Self {
        Self {
            spec,
            host: host.into(),
            success_exit_codes: default_success_exit_codes(),
            busy_exit_codes: Vec::new(),
            step_timeout: definition.timeout(),
            max_attempts: definition.max_attempts.max(1),
            retry: definition.retry_policy(),
            issue_type,
        }
    }

    pub(crate) fn with_exit_codes(mut self, success: Vec<i32>, busy: Vec<i32>) -> Self {
        self.success_exit_codes = success;
        self.busy_exit_codes = busy;
        self
    }

    /// Run one tick: run the tool if it has not run for this attempt,
    /// otherwise judge the recorded exit code
    pub(crate) async fn tick(
        &self,
        runner: &dyn ProcessRunner,
        ctx: &StepContext,
        cancel: &CancellationToken,
        escalation: &DiagnosticsEscalation,
    ) -> Result<ExecutionResult> {
        let mut state = match begin_tick(ctx, cancel, self.step_timeout).await? {
            TickStart::Ready(state) => state,
            TickStart::Finished(result) => return Ok(result),
            TickStart::Expired(mut state, err) => {
                return self.fail(ctx, &mut state, err, escalation).await;
            }
        };

        match (state.requested, state.exit_code) {
            (false, None) => self.run(runner, ctx, &mut state, escalation).await,
            (true, Some(code)) => self.judge(ctx, &mut state, code, escalation).await,
            (true, None) => Err(StepError::InvalidState(
                "requested is set but no exit code is recorded".to_string(),
            )),
            (false, Some(_)) => Err(StepError::InvalidState(
                "exit code recorded for a request that was never made".to_string(),
            )),
        }
    }

    async fn run(
        &self,
        runner: &dyn ProcessRunner,
        ctx: &StepContext,
        state: &mut StepState,
        escalation: &DiagnosticsEscalation,
    ) -> Result<ExecutionResult> {
        // The tool never outlives the step deadline
        let remaining = state.step_deadline().remaining(ctx.now());
        let mut bounded = self.spec.clone();
        bounded.timeout = bounded.timeout.min(remaining);

        info!(
            experiment = %ctx.experiment_id(),
            step = %ctx.step_id(),
            host = %self.host,
            command = %bounded.command_line(),
            timeout_secs = bounded.timeout.as_secs(),
            attempt = state.attempt + 1,
            "Running tool"
        );

        let spec = &bounded;
        let busy = &self.busy_exit_codes;
        let outcome = self
            .retry
            .run_when(
                self.issue_type,
                |err: &ControlError| matches!(err, ControlError::Busy(_)),
                move || async move {
                    let output = runner.run(spec).await?;
                    if busy.contains(&output.exit_code) {
                        return Err(ControlError::Busy(format!(
                            "{} exited with busy code {}",
                            spec.executable, output.exit_code
                        )));
                    }
                    Ok(output)
                },
            )
            .await;

        match outcome {
            Ok(output) => {
                self.record(state, &output);
                ctx.save_state(state).await?;
                debug!(step = %ctx.step_id(), exit_code = output.exit_code, "Tool finished");
                Ok(ExecutionResult::in_progress_continue())
            }
            Err(err @ StepError::RetryExhausted { .. }) => {
                warn!(step = %ctx.step_id(), host = %self.host, error = %err, "Tool busy, retrying on a later tick");
                Ok(ExecutionResult::in_progress())
            }
            Err(err) => self.fail(ctx, state, err, escalation).await,
        }
    }

    fn record(&self, state: &mut StepState, output: &ProcessOutput) {
        state.requested = true;
        state.exit_code = Some(output.exit_code);

        let tail = output.tail(OUTPUT_TAIL_LINES);
        if !tail.is_empty() {
            state.last_output = Some(tail);
        }
    }

    async fn judge(
        &self,
        ctx: &StepContext,
        state: &mut StepState,
        code: i32,
        escalation: &DiagnosticsEscalation,
    ) -> Result<ExecutionResult> {
        if self.success_exit_codes.contains(&code) {
            state.completed = true;
            ctx.save_state(state).await?;
            info!(experiment = %ctx.experiment_id(), step = %ctx.step_id(), host = %self.host, "Tool succeeded");
            return Ok(ExecutionResult::succeeded());
        }

        let attempt = state.attempt + 1;
        if attempt < self.max_attempts {
            info!(
                step = %ctx.step_id(),
                host = %self.host,
                exit_code = code,
                attempt = attempt,
                max = self.max_attempts,
                "Tool failed, will run again"
            );
            state.attempt += 1;
            state.requested = false;
            state.exit_code = None;
            ctx.save_state(state).await?;
            return Ok(ExecutionResult::in_progress());
        }

        let error = StepError::VerifiedFailure {
            target: self.host.clone(),
            request_id: None,
            message: format!("exit code {}", code),
            attempt,
            max_attempts: self.max_attempts,
        };
        self.fail(ctx, state, error, escalation).await
    }

    /// Escalate the host's failure, then record it as terminal
    async fn fail(
        &self,
        ctx: &StepContext,
        state: &mut StepState,
        error: StepError,
        escalation: &DiagnosticsEscalation,
    ) -> Result<ExecutionResult> {
        let failures = [TargetFailure::new(self.host.as_str(), None, error)];
        escalation.escalate(ctx, self.issue_type, &failures).await;

        let [failure] = failures;
        fail_step(ctx, state, failure.error).await
    }
}

/// Parameters of `run-command`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandParameters {
    pub executable: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Host the command runs on, used as the diagnostics target
    #[serde(default = "default_host")]
    pub host: String,

    /// Kill the process after this long
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    #[serde(default = "default_success_exit_codes")]
    pub success_exit_codes: Vec<i32>,

    /// Exit codes meaning "busy, try again"
    #[serde(default)]
    pub busy_exit_codes: Vec<i32>,
}

impl StepParameters for CommandParameters {
    fn validate(&self) -> Result<()> {
        require_non_empty("executable", &self.executable)?;
        require_non_empty("host", &self.host)?;
        if self.tool_timeout_secs == 0 {
            return Err(StepError::Configuration(
                "tool_timeout_secs must be positive".to_string(),
            ));
        }
        validate_exit_codes(&self.success_exit_codes, &self.busy_exit_codes)
    }
}

/// Run an arbitrary command on the experiment host
pub struct RunCommandStep {
    invocation: CommandInvocation,
    wiring: ProcessWiring,
}

impl RunCommandStep {
    pub const TYPE: &'static str = "run-command";

    pub fn from_definition(definition: &StepDefinition) -> Result<Self> {
        let parameters: CommandParameters = definition.parameters()?;

        let mut spec = ProcessSpec::new(
            parameters.executable,
            Duration::from_secs(parameters.tool_timeout_secs),
        )
        .with_args(parameters.args);
        if let Some(dir) = parameters.working_dir {
            spec = spec.with_working_dir(dir);
        }

        let invocation = CommandInvocation::new(definition, "command", spec, parameters.host)
            .with_exit_codes(parameters.success_exit_codes, parameters.busy_exit_codes);

        Ok(Self {
            invocation,
            wiring: ProcessWiring::default(),
        })
    }

    pub fn build(definition: &StepDefinition) -> Result<Box<dyn Step>> {
        Ok(Box::new(Self::from_definition(definition)?))
    }

    pub fn process_spec(&self) -> &ProcessSpec {
        &self.invocation.spec
    }
}

#[async_trait]
impl Step for RunCommandStep {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn description(&self) -> &str {
        "Run an arbitrary command on the experiment host"
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
