//! Crucible control-plane clients
//!
//! This crate provides the narrow client interfaces that experiment steps
//! use to reach systems outside the process: the node-isolation control
//! plane, the hardware process runner, and the diagnostics sink.
//!
//! # Clients
//!
//! - **NodeIsolationClient**: applies changes to physical nodes (microcode,
//!   firewall rules, power state) and reports request status
//! - **ProcessRunner**: runs vendor tools with a bounded timeout
//! - **DiagnosticsSink**: fire-and-forget forensic collection requests
//!
//! Every client is a `Send + Sync` trait object so a single instance can be
//! shared by all concurrent per-node sub-operations of a tick. The
//! `scripted` module carries in-memory implementations for tests.
//!
//! # Example
//!
//! ```
//! use crucible_control::{ChangeRequest, ChangeKind, NodeIsolationClient, ScriptedIsolationClient};
//!
//! # async fn example() -> crucible_control::Result<()> {
//! let client = ScriptedIsolationClient::new();
//! let request = ChangeRequest::new(ChangeKind::Microcode).with_parameter("package", "ucode-0x2c");
//!
//! let request_id = client.apply_change("node-01", &request).await?;
//! let status = client.get_change_status("node-01", &request_id).await?;
//! assert!(!status.is_finished());
//! # Ok(())
//! # }
//! ```

pub mod diagnostics;
pub mod error;
pub mod http;
pub mod isolation;
pub mod process;
pub mod scripted;
pub mod types;

pub use diagnostics::{DiagnosticsRequest, DiagnosticsSink, TracingDiagnosticsSink};
pub use error::{ControlError, Result};
pub use http::{HttpIsolationClient, HttpIsolationConfig};
pub use isolation::NodeIsolationClient;
pub use process::{ProcessOutput, ProcessRunner, ProcessSpec, TokioProcessRunner};
pub use scripted::{
    IsolationCall, RecordingDiagnosticsSink, ScriptedIsolationClient, ScriptedProcessRunner,
};
pub use types::{
    ChangeKind, ChangeRequest, ChangeResult, ChangeState, ChangeStatus, NodeStatus, PowerAction,
    RequestId,
};
