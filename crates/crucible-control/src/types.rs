//! Common types for control-plane operations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Handle returned by the control plane when a request is accepted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of change applied to a node through the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    /// Deploy a microcode package
    Microcode,
    /// Apply network isolation (firewall) rules
    Firewall,
    /// Push BIOS/BMC settings
    Firmware,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Microcode => write!(f, "microcode"),
            ChangeKind::Firewall => write!(f, "firewall"),
            ChangeKind::Firmware => write!(f, "firmware"),
        }
    }
}

/// Parameters of a change request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub kind: ChangeKind,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl ChangeRequest {
    pub fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Whether the control plane is still working on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeState {
    Pending,
    Finished,
}

/// Outcome of a finished request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeResult {
    Succeeded,
    Failed,
}

/// Status of a change request as reported by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStatus {
    pub state: ChangeState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ChangeResult>,

    /// Machine-readable result code (e.g. `NodeBusy`), used to decide
    /// whether a failed request can be reissued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ChangeStatus {
    pub fn pending() -> Self {
        Self {
            state: ChangeState::Pending,
            result: None,
            result_code: None,
            note: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            state: ChangeState::Finished,
            result: Some(ChangeResult::Succeeded),
            result_code: None,
            note: None,
        }
    }

    pub fn failed(result_code: impl Into<String>) -> Self {
        Self {
            state: ChangeState::Finished,
            result: Some(ChangeResult::Failed),
            result_code: Some(result_code.into()),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.state == ChangeState::Finished
    }

    pub fn is_success(&self) -> bool {
        self.is_finished() && self.result == Some(ChangeResult::Succeeded)
    }

    /// A finished request without a success result counts as failed
    pub fn is_failure(&self) -> bool {
        self.is_finished() && self.result != Some(ChangeResult::Succeeded)
    }
}

/// Power action requested for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    On,
    Off,
    Cycle,
    Reset,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerAction::On => write!(f, "on"),
            PowerAction::Off => write!(f, "off"),
            PowerAction::Cycle => write!(f, "cycle"),
            PowerAction::Reset => write!(f, "reset"),
        }
    }
}

/// Vendor-specific node status payload
///
/// The control plane embeds agent output in a free-form blob. It is kept
/// verbatim and only surfaced in step output and failure messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeStatus(String);

impl NodeStatus {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First non-empty line of the payload, for log fields
    pub fn headline(&self) -> &str {
        self.0
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_status_classification() {
        assert!(!ChangeStatus::pending().is_finished());
        assert!(ChangeStatus::succeeded().is_success());
        assert!(!ChangeStatus::succeeded().is_failure());

        let failed = ChangeStatus::failed("NodeBusy");
        assert!(failed.is_failure());
        assert_eq!(failed.result_code.as_deref(), Some("NodeBusy"));

        let no_result = ChangeStatus {
            state: ChangeState::Finished,
            result: None,
            result_code: None,
            note: None,
        };
        assert!(no_result.is_failure());
    }

    #[test]
    fn test_change_status_wire_format() {
        let json = r#"{"state":"finished","result":"failed","resultCode":"Conflict","note":"locked"}"#;
        let status: ChangeStatus = serde_json::from_str(json).unwrap();

        assert_eq!(status.state, ChangeState::Finished);
        assert_eq!(status.result, Some(ChangeResult::Failed));
        assert_eq!(status.result_code.as_deref(), Some("Conflict"));
        assert_eq!(status.note.as_deref(), Some("locked"));
    }

    #[test]
    fn test_change_request_parameters() {
        let request = ChangeRequest::new(ChangeKind::Microcode)
            .with_parameter("package", "ucode-2c")
            .with_parameter("version", "0x2c");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "microcode");
        assert_eq!(json["parameters"]["version"], "0x2c");
    }

    #[test]
    fn test_display() {
        assert_eq!(PowerAction::Cycle.to_string(), "cycle");
        assert_eq!(ChangeKind::Firewall.to_string(), "firewall");
        assert_eq!(RequestId::new("r-1").to_string(), "r-1");
    }

    #[test]
    fn test_node_status_headline() {
        let status = NodeStatus::new("\n  power: on  \nagent: healthy\n");
        assert_eq!(status.headline(), "power: on");
        assert_eq!(NodeStatus::new("").headline(), "");
    }
}
