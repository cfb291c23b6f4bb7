//! Node-isolation control plane client trait

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChangeRequest, ChangeStatus, NodeStatus, PowerAction, RequestId};

/// Client for the external node-isolation control plane
///
/// The control plane mediates every change made to a physical node. Calls
/// return as soon as the request is accepted; completion is observed by
/// polling `get_change_status` on later ticks.
#[async_trait]
pub trait NodeIsolationClient: Send + Sync {
    /// Submit a change for a node
    async fn apply_change(&self, target: &str, request: &ChangeRequest) -> Result<RequestId>;

    /// Current status of a previously submitted request
    async fn get_change_status(&self, target: &str, request_id: &RequestId)
        -> Result<ChangeStatus>;

    /// Confirm that a request failed
    ///
    /// Used to turn a failed status into a verified failure.
    async fn is_change_failed(&self, target: &str, request_id: &RequestId) -> Result<bool>;

    /// Request a power state change for a node
    async fn set_power_state(&self, target: &str, action: PowerAction) -> Result<RequestId>;

    /// Vendor status payload for a node, scoped to a request
    async fn get_node_status(&self, target: &str, request_id: &RequestId) -> Result<NodeStatus>;
}
