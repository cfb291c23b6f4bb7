//! Host configuration
//!
//! One TOML file describes where the control plane lives, where step state
//! is persisted, and the experiment whose steps are ticked.

use color_eyre::eyre::{eyre, Result, WrapErr};
use crucible_core::{StepDefinition, StepRegistry};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_state_path() -> PathBuf {
    PathBuf::from("crucible-state.redb")
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_lookback_minutes() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub control_plane: ControlPlaneConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    pub experiment: ExperimentConfig,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlPlaneConfig {
    pub url: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// ReDB database file
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// How far back collected data reaches before the failure
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lookback_minutes: default_lookback_minutes(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub id: String,
}

impl HostConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content).wrap_err_with(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.experiment.id.trim().is_empty() {
            return Err(eyre!("experiment.id must not be empty"));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(eyre!("step id {} is used twice", step.id));
            }
        }
        Ok(())
    }

    /// Build every step once to surface configuration errors up front
    pub fn validate_steps(&self, registry: &StepRegistry) -> Result<()> {
        for definition in &self.steps {
            registry
                .build(definition)
                .wrap_err_with(|| format!("step {}", definition.id))?;
        }
        Ok(())
    }
}
