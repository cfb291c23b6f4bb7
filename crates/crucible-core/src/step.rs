//! Step trait definition
//!
//! A step is one resumable unit of experiment work. The scheduler calls
//! [`Step::execute`] repeatedly; each call (a tick) loads the persisted
//! state, makes at most one round of external calls, persists, and
//! returns promptly.

use crate::context::{StepContext, StepDependencies};
use crate::error::{Result, StepError};
use crate::governor::TimeoutScope;
use crate::result::ExecutionResult;
use crate::state::StepState;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Core trait for resumable steps
///
/// # Example
///
/// ```ignore
/// use crucible_core::{begin_tick, ExecutionResult, Result, Step, StepContext, TickStart};
///
/// #[async_trait]
/// impl Step for NoopStep {
///     fn name(&self) -> &str {
///         "noop"
///     }
///
///     fn timeout(&self) -> Duration {
///         Duration::from_secs(60)
///     }
///
///     async fn execute(&self, ctx: &StepContext, cancel: &CancellationToken) -> Result<ExecutionResult> {
///         let mut state = match begin_tick(ctx, cancel, self.timeout()).await? {
///             TickStart::Ready(state) => state,
///             TickStart::Finished(result) => return Ok(result),
///             TickStart::Expired(mut state, err) => return fail_step(ctx, &mut state, err).await,
///         };
///         state.requested = true;
///         state.completed = true;
///         ctx.save_state(&state).await?;
///         Ok(ExecutionResult::succeeded())
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    /// Step type name (used for registration and lookup)
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str {
        ""
    }

    /// Whole-step timeout; the deadline is derived from it once
    fn timeout(&self) -> Duration;

    /// Wire external clients
    ///
    /// Called once per process before the first tick. Calling it again with
    /// the same dependencies has no further effect.
    fn configure(&mut self, deps: &StepDependencies) -> Result<()> {
        let _ = deps;
        Ok(())
    }

    /// Run one tick
    ///
    /// Expected outcomes, including verified failures and timeouts, are
    /// returned as `Ok`. `Err` is reserved for faults such as corrupted
    /// state, after which nothing has been persisted for this tick.
    async fn execute(&self, ctx: &StepContext, cancel: &CancellationToken)
        -> Result<ExecutionResult>;
}

/// Where a tick stands after the common entry checks
#[derive(Debug)]
pub enum TickStart {
    /// Nothing left to do; return this result
    Finished(ExecutionResult),
    /// The whole-step deadline has passed
    Expired(StepState, StepError),
    /// Proceed with issuance or polling
    Ready(StepState),
}

/// Entry sequence shared by every step
///
/// Checks cancellation without touching the store, then loads the state
/// or creates and persists a fresh one, short-circuits terminal states,
/// and finally checks the whole-step deadline.
pub async fn begin_tick(
    ctx: &StepContext,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<TickStart> {
    if cancel.is_cancelled() {
        info!(experiment = %ctx.experiment_id(), step = %ctx.step_id(), "Step cancelled");
        return Ok(TickStart::Finished(ExecutionResult::cancelled()));
    }

    let now = ctx.now();

    let state = match ctx.load_state().await? {
        Some(state) => {
            state.validate()?;
            state
        }
        None => {
            let state = StepState::new(now, timeout);
            ctx.save_state(&state).await?;
            debug!(
                experiment = %ctx.experiment_id(),
                step = %ctx.step_id(),
                deadline = %state.deadline,
                "Initialized step state"
            );
            state
        }
    };

    if state.completed {
        return Ok(TickStart::Finished(ExecutionResult::succeeded()));
    }

    if let Some(failure) = &state.failure {
        return Ok(TickStart::Finished(ExecutionResult::failed(
            StepError::AlreadyFailed(failure.clone()),
        )));
    }

    if let Err(err) = state.step_deadline().check(now, TimeoutScope::Step) {
        return Ok(TickStart::Expired(state, err));
    }

    Ok(TickStart::Ready(state))
}

/// Record a terminal failure and persist it
///
/// Later ticks see `failure` set and repeat `Failed` without calling out.
pub async fn fail_step(
    ctx: &StepContext,
    state: &mut StepState,
    error: StepError,
) -> Result<ExecutionResult> {
    let message = match &state.last_output {
        Some(output) if !output.is_empty() => format!("{} (last output: {})", error, output),
        _ => error.to_string(),
    };

    warn!(
        experiment = %ctx.experiment_id(),
        step = %ctx.step_id(),
        attempt = state.attempt,
        error = %message,
        "Step failed"
    );

    state.failure = Some(message);
    ctx.save_state(state).await?;

    Ok(ExecutionResult::failed(error))
}
