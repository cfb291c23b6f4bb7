//! Step registry
//!
//! Maps step type names to constructors. Populated by explicit
//! `register` calls at startup, so the set of available step types is
//! known before any experiment runs.

use crate::config::StepDefinition;
use crate::context::StepDependencies;
use crate::error::{Result, StepError};
use crate::step::Step;
use std::collections::BTreeMap;
use tracing::debug;

/// Builds a step from its definition, validating typed parameters
pub type StepConstructor = fn(&StepDefinition) -> Result<Box<dyn Step>>;

/// Registry of step constructors
///
/// # Example
///
/// ```ignore
/// use crucible_core::StepRegistry;
///
/// let mut registry = StepRegistry::new();
/// crucible_steps::register_all(&mut registry);
///
/// let step = registry.build_configured(&definition, &deps)?;
/// ```
#[derive(Default, Clone)]
pub struct StepRegistry {
    constructors: BTreeMap<String, StepConstructor>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, replacing any previous one for `step_type`
    pub fn register(&mut self, step_type: impl Into<String>, constructor: StepConstructor) {
        let step_type = step_type.into();
        debug!(step_type = %step_type, "Registered step type");
        self.constructors.insert(step_type, constructor);
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.constructors.contains_key(step_type)
    }

    /// Registered step type names, sorted
    pub fn step_types(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Validate a definition and construct its step
    pub fn build(&self, definition: &StepDefinition) -> Result<Box<dyn Step>> {
        let constructor = self
            .constructors
            .get(&definition.step_type)
            .ok_or_else(|| StepError::UnknownStepType(definition.step_type.clone()))?;

        definition.validate()?;
        constructor(definition)
    }

    /// Construct a step and wire its dependencies
    pub fn build_configured(
        &self,
        definition: &StepDefinition,
        deps: &StepDependencies,
    ) -> Result<Box<dyn Step>> {
        let mut step = self.build(definition)?;
        step.configure(deps)?;
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StepContext;
    use crate::result::ExecutionResult;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct NoopStep {
        timeout: Duration,
    }

    #[async_trait]
    impl Step for NoopStep {
        fn name(&self) -> &str {
            "noop"
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        async fn execute(
            &self,
            _ctx: &StepContext,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionResult> {
            Ok(ExecutionResult::succeeded())
        }
    }

    fn build_noop(definition: &StepDefinition) -> Result<Box<dyn Step>> {
        Ok(Box::new(NoopStep {
            timeout: definition.timeout(),
        }))
    }

    #[test]
    fn test_register_and_build() {
        let mut registry = StepRegistry::new();
        registry.register("noop", build_noop);

        assert!(registry.contains("noop"));
        assert_eq!(registry.step_types(), vec!["noop"]);
        assert_eq!(registry.len(), 1);

        let step = registry
            .build(&StepDefinition::new("s1", "noop").with_timeout(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(step.name(), "noop");
        assert_eq!(step.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_step_type() {
        let registry = StepRegistry::new();
        let err = registry
            .build(&StepDefinition::new("s1", "reticulate-splines"))
            .err()
            .unwrap();
        assert!(matches!(err, StepError::UnknownStepType(ref t) if t == "reticulate-splines"));
    }

    #[test]
    fn test_build_validates_definition() {
        let mut registry = StepRegistry::new();
        registry.register("noop", build_noop);

        let mut definition = StepDefinition::new("s1", "noop");
        definition.timeout_secs = 0;
        assert!(matches!(
            registry.build(&definition),
            Err(StepError::Configuration(_))
        ));
    }

    #[test]
    fn test_build_configured() {
        let mut registry = StepRegistry::new();
        registry.register("noop", build_noop);

        let step = registry
            .build_configured(&StepDefinition::new("s1", "noop"), &StepDependencies::new())
            .unwrap();
        assert_eq!(step.name(), "noop");
    }
}
