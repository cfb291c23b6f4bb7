//! Crucible experiment steps
//!
//! Concrete steps built on the resumable step protocol in `crucible-core`.
//! Fan-out steps drive the node-isolation control plane through a
//! [`FanOutTracker`](crucible_core::FanOutTracker); process steps run a
//! vendor tool once per attempt and judge its exit code locally.
//!
//! # Example
//!
//! ```ignore
//! use crucible_steps::create_registry;
//!
//! let registry = create_registry();
//! let step = registry.build_configured(&definition, &deps)?;
//! let result = step.execute(&ctx, &cancel).await?;
//! ```

pub mod steps;

pub use steps::{
    ApplyIsolationStep, CommandParameters, DeployMicrocodeStep, FlashFpgaParameters,
    FlashFpgaStep, IsolationParameters, MicrocodeParameters, PowerCycleParameters,
    PowerCycleStep, RunCommandStep,
};

use crucible_core::StepRegistry;

/// Register every step type with the registry
pub fn register_all(registry: &mut StepRegistry) {
    registry.register(DeployMicrocodeStep::TYPE, DeployMicrocodeStep::build);
    registry.register(PowerCycleStep::TYPE, PowerCycleStep::build);
    registry.register(ApplyIsolationStep::TYPE, ApplyIsolationStep::build);
    registry.register(FlashFpgaStep::TYPE, FlashFpgaStep::build);
    registry.register(RunCommandStep::TYPE, RunCommandStep::build);
}

/// Create a registry with all step types pre-registered
pub fn create_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_all(&mut registry);
    registry
}


#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::{StepDefinition, StepError};
    use serde_json::json;

    #[test]
    fn test_all_step_types_registered() {
        let registry = create_registry();
        assert_eq!(
            registry.step_types(),
            vec![
                "apply-isolation",
                "deploy-microcode",
                "flash-fpga",
                "power-cycle",
                "run-command"
            ]
        );
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let registry = create_registry();
        let result = registry.build(&StepDefinition::new("s1", "bake-cake"));
        assert!(matches!(result, Err(StepError::UnknownStepType(_))));
    }

    #[test]
    fn test_registry_rejects_unknown_parameter() {
        let registry = create_registry();
        let definition = StepDefinition::new("s1", "run-command")
            .with_parameters(json!({"executable": "true", "argz": ["-v"]}));

        assert!(matches!(
            registry.build(&definition),
            Err(StepError::Configuration(_))
        ));
    }
}
