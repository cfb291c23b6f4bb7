//! Crucible Step Engine
//!
//! This crate implements the resumable step protocol used to run hardware
//! experiments. A step never waits for an external operation to finish;
//! instead it is ticked repeatedly by a scheduler and derives its next move
//! from persisted state plus what it observes now.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                    StepRegistry                        │
//! │   step type name -> constructor (typed parameters)     │
//! └───────────────────────────────────────────────────────┘
//!                          │ build + configure
//!                          ▼
//! ┌───────────────────────────────────────────────────────┐
//! │                  Step::execute (tick)                  │
//! │  cancel? -> load/init state -> terminal? -> deadline?  │
//! │        -> issue (RetryPolicy) | poll (FanOutTracker)   │
//! └───────────────────────────────────────────────────────┘
//!          │                    │                  │
//!          ▼                    ▼                  ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌──────────────────────┐
//! │   StateStore   │  │  Control clients │  │ DiagnosticsEscalation │
//! │ Memory | ReDB  │  │ isolation | proc │  │  on terminal failure  │
//! └────────────────┘  └──────────────────┘  └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use crucible_core::{StepContext, StepDependencies, StepRegistry, MemoryStateStore};
//! use tokio_util::sync::CancellationToken;
//!
//! let step = registry.build_configured(&definition, &deps)?;
//! let ctx = StepContext::new("exp-1", &definition.id, store.clone());
//! let result = step.execute(&ctx, &CancellationToken::new()).await?;
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod governor;
pub mod redb_store;
pub mod registry;
pub mod result;
pub mod retry;
pub mod state;
pub mod step;
pub mod store;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{StepDefinition, StepParameters};
pub use context::{StepContext, StepDependencies};
pub use diagnostics::{DiagnosticsEscalation, TargetFailure};
pub use error::{Result, StepError};
pub use governor::{Deadline, TimeoutScope};
pub use redb_store::RedbStateStore;
pub use registry::{StepConstructor, StepRegistry};
pub use result::{ExecutionResult, ExecutionStatus};
pub use retry::RetryPolicy;
pub use state::{RequestDescriptor, StepState};
pub use step::{begin_tick, fail_step, Step, TickStart};
pub use store::{MemoryStateStore, StateScope, StateStore};
pub use tracker::{DistributedOperation, FanOutTracker, TrackerOutcome, TrackerSettings};

/// Re-exported so steps and hosts share one cancellation type
pub use tokio_util::sync::CancellationToken;
