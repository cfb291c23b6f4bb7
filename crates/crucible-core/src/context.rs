//! Step execution context and injected dependencies
//!
//! A `StepContext` identifies the step instance being ticked and gives it
//! access to its slice of the state store. `StepDependencies` carries the
//! external clients; it is built once by the host and handed to every
//! step's `configure`.

use crate::clock::{Clock, SystemClock};
use crate::diagnostics::{DiagnosticsEscalation, DEFAULT_LOOKBACK};
use crate::error::{Result, StepError};
use crate::state::StepState;
use crate::store::{self, StateScope, StateStore};
use chrono::{DateTime, Utc};
use crucible_control::{DiagnosticsSink, NodeIsolationClient, ProcessRunner, TracingDiagnosticsSink};
use std::sync::Arc;
use std::time::Duration;

/// Context provided to a step on every tick
#[derive(Clone)]
pub struct StepContext {
    /// Experiment this step belongs to
    experiment_id: String,

    /// Step instance identifier
    step_id: String,

    /// State group shared with other steps, if any
    group: Option<String>,

    store: Arc<dyn StateStore>,

    clock: Arc<dyn Clock>,

    /// Whether diagnostics collection is enabled for the experiment
    diagnostics_enabled: bool,
}

impl StepContext {
    /// Create a new step context
    pub fn new(
        experiment_id: impl Into<String>,
        step_id: impl Into<String>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            step_id: step_id.into(),
            group: None,
            store,
            clock: Arc::new(SystemClock),
            diagnostics_enabled: false,
        }
    }

    /// Share state with the other steps of `group`
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable or disable diagnostics escalation
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics_enabled = enabled;
        self
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn diagnostics_enabled(&self) -> bool {
        self.diagnostics_enabled
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Scope the step's state lives in
    pub fn state_scope(&self) -> StateScope {
        match &self.group {
            Some(group) => StateScope::Group(group.clone()),
            None => StateScope::Step,
        }
    }

    /// Key of the step's state within its scope
    ///
    /// Grouped steps of one experiment share a single record.
    pub fn state_key(&self) -> String {
        match &self.group {
            Some(_) => self.experiment_id.clone(),
            None => format!("{}/{}", self.experiment_id, self.step_id),
        }
    }

    /// Read this step's persisted state
    pub async fn load_state(&self) -> Result<Option<StepState>> {
        store::load(self.store.as_ref(), &self.state_key(), &self.state_scope()).await
    }

    /// Persist this step's state
    pub async fn save_state(&self, state: &StepState) -> Result<()> {
        store::save(self.store.as_ref(), &self.state_key(), &self.state_scope(), state).await
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("experiment_id", &self.experiment_id)
            .field("step_id", &self.step_id)
            .field("group", &self.group)
            .field("clock", &self.clock)
            .field("diagnostics_enabled", &self.diagnostics_enabled)
            .finish_non_exhaustive()
    }
}

/// External clients available to steps
///
/// Constructed once per process. Steps take the clients they need in
/// `configure` and fail with `NotConfigured` when one is missing.
#[derive(Clone)]
pub struct StepDependencies {
    isolation: Option<Arc<dyn NodeIsolationClient>>,
    process: Option<Arc<dyn ProcessRunner>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    diagnostics_lookback: Duration,
}

impl Default for StepDependencies {
    fn default() -> Self {
        Self {
            isolation: None,
            process: None,
            diagnostics: Arc::new(TracingDiagnosticsSink),
            diagnostics_lookback: DEFAULT_LOOKBACK,
        }
    }
}

impl StepDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isolation(mut self, client: Arc<dyn NodeIsolationClient>) -> Self {
        self.isolation = Some(client);
        self
    }

    pub fn with_process_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.process = Some(runner);
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    /// Window of data collected before a failure
    pub fn with_diagnostics_lookback(mut self, lookback: Duration) -> Self {
        self.diagnostics_lookback = lookback;
        self
    }

    pub fn isolation(&self) -> Result<Arc<dyn NodeIsolationClient>> {
        self.isolation
            .clone()
            .ok_or_else(|| StepError::NotConfigured("no node-isolation client".to_string()))
    }

    pub fn process_runner(&self) -> Result<Arc<dyn ProcessRunner>> {
        self.process
            .clone()
            .ok_or_else(|| StepError::NotConfigured("no process runner".to_string()))
    }

    pub fn diagnostics(&self) -> Arc<dyn DiagnosticsSink> {
        self.diagnostics.clone()
    }

    /// Escalation over the configured sink and lookback
    pub fn escalation(&self) -> DiagnosticsEscalation {
        DiagnosticsEscalation::new(self.diagnostics.clone()).with_lookback(self.diagnostics_lookback)
    }
}
