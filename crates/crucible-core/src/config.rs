//! Typed step configuration
//!
//! A `StepDefinition` carries the options every step shares plus a
//! free-form `parameters` value. Each step type deserializes the
//! parameters into its own struct with `deny_unknown_fields`, so a
//! misspelled key fails when the step is built rather than being
//! silently ignored.

use crate::error::{Result, StepError};
use crate::retry::RetryPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    1800
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_backoff_base() -> u32 {
    2
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_retryable_codes() -> Vec<String> {
    vec![
        "NodeBusy".to_string(),
        "Conflict".to_string(),
        "AgentUnavailable".to_string(),
    ]
}

/// Definition of one step instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    /// Step instance identifier, unique within the experiment
    pub id: String,

    /// Registered step type name
    #[serde(rename = "type")]
    pub step_type: String,

    /// State group shared with other steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Whole-step timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Per-target request timeout for fan-out steps
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Whole-operation attempts, first issuance included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Calls per external request before giving up for this tick
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: u32,

    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,

    /// Control-plane result codes that allow a failed request to be reissued
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<String>,

    /// Step-type specific parameters
    #[serde(default)]
    pub parameters: Value,
}

/// Typed parameters of one step type
pub trait StepParameters: DeserializeOwned {
    /// Check values serde cannot express
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

impl StepDefinition {
    /// Definition with default options and no parameters
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            group: None,
            timeout_secs: default_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_attempts: default_retry_attempts(),
            backoff_base: default_backoff_base(),
            backoff_unit_ms: default_backoff_unit_ms(),
            retryable_codes: default_retryable_codes(),
            parameters: Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit_ms = u64::try_from(unit.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Deserialize and validate the step-type parameters
    pub fn parameters<T: StepParameters>(&self) -> Result<T> {
        let value = match &self.parameters {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        let parameters: T = serde_json::from_value(value).map_err(|e| {
            StepError::Configuration(format!("step {} ({}): {}", self.id, self.step_type, e))
        })?;
        parameters.validate().map_err(|e| match e {
            StepError::Configuration(msg) => {
                StepError::Configuration(format!("step {}: {}", self.id, msg))
            }
            other => other,
        })?;

        Ok(parameters)
    }

    /// Check the shared options
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StepError::Configuration(format!("step {}: {}", self.id, msg)));

        if self.id.trim().is_empty() {
            return Err(StepError::Configuration("step id must not be empty".to_string()));
        }
        if self.step_type.trim().is_empty() {
            return invalid("type must not be empty");
        }
        if self.timeout_secs == 0 {
            return invalid("timeout_secs must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be greater than zero");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.retry_attempts == 0 {
            return invalid("retry_attempts must be at least 1");
        }
        if self.backoff_base == 0 {
            return invalid("backoff_base must be at least 1");
        }
        if !(self.parameters.is_null() || self.parameters.is_object()) {
            return invalid("parameters must be a table");
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Policy for single external calls, identical on every tick
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.backoff_base)
            .with_backoff_unit(Duration::from_millis(self.backoff_unit_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct FlashParameters {
        image: String,
        #[serde(default = "default_slot")]
        slot: u8,
    }

    fn default_slot() -> u8 {
        1
    }

    impl StepParameters for FlashParameters {
        fn validate(&self) -> Result<()> {
            if self.image.is_empty() {
                return Err(StepError::Configuration("image must not be empty".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_defaults() {
        let definition: StepDefinition =
            serde_json::from_value(json!({"id": "s1", "type": "flash-fpga"})).unwrap();

        assert_eq!(definition.timeout(), Duration::from_secs(3600));
        assert_eq!(definition.request_timeout(), Duration::from_secs(1800));
        assert_eq!(definition.max_attempts, 3);
        assert_eq!(definition.retryable_codes.len(), 3);
        assert!(definition.validate().is_ok());

        let policy = definition.retry_policy();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let result: std::result::Result<StepDefinition, _> = serde_json::from_value(json!({
            "id": "s1",
            "type": "flash-fpga",
            "timeout_sec": 10
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_typed_parameters() {
        let definition = StepDefinition::new("s1", "flash-fpga")
            .with_parameters(json!({"image": "golden.bit"}));

        let params: FlashParameters = definition.parameters().unwrap();
        assert_eq!(params.image, "golden.bit");
        assert_eq!(params.slot, 1);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let definition = StepDefinition::new("s1", "flash-fpga")
            .with_parameters(json!({"image": "golden.bit", "slott": 2}));

        let err = definition.parameters::<FlashParameters>().unwrap_err();
        assert!(matches!(err, StepError::Configuration(_)));
        assert!(err.to_string().contains("slott"));
    }

    #[test]
    fn test_missing_required_parameter() {
        let definition = StepDefinition::new("s1", "flash-fpga");
        let err = definition.parameters::<FlashParameters>().unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn test_parameter_validation() {
        let definition =
            StepDefinition::new("s1", "flash-fpga").with_parameters(json!({"image": ""}));
        let err = definition.parameters::<FlashParameters>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: step s1: image must not be empty"
        );
    }

    #[test]
    fn test_validate_shared_options() {
        let mut definition = StepDefinition::new("s1", "power-cycle");
        definition.max_attempts = 0;
        assert!(definition.validate().is_err());

        let definition = StepDefinition::new("s1", "power-cycle").with_parameters(json!([1, 2]));
        assert!(definition.validate().is_err());

        assert!(StepDefinition::new("", "power-cycle").validate().is_err());
    }
}
