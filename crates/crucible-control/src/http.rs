//! HTTP client for the node-isolation control plane
//!
//! The control plane exposes a small JSON API:
//!
//! ```text
//! POST {base}/api/v1/nodes/{target}/changes                      -> {"requestId": ".."}
//! GET  {base}/api/v1/nodes/{target}/changes/{request}            -> ChangeStatus
//! GET  {base}/api/v1/nodes/{target}/changes/{request}/failed     -> {"failed": bool}
//! POST {base}/api/v1/nodes/{target}/power                        -> {"requestId": ".."}
//! GET  {base}/api/v1/nodes/{target}/status?requestId={request}   -> text payload
//! ```

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{ControlError, Result};
use crate::isolation::NodeIsolationClient;
use crate::types::{ChangeRequest, ChangeStatus, NodeStatus, PowerAction, RequestId};

/// Default per-call timeout
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the control plane
#[derive(Debug, Clone)]
pub struct HttpIsolationConfig {
    /// Base URL (e.g. https://isolation.example.net)
    pub base_url: String,
    /// Bearer token, if the deployment requires one
    pub token: Option<String>,
    /// Timeout applied to each HTTP call
    pub call_timeout: Duration,
}

impl HttpIsolationConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestAccepted {
    request_id: RequestId,
}

#[derive(Debug, Deserialize)]
struct FailedProbe {
    failed: bool,
}

#[derive(Debug, Serialize)]
struct PowerBody {
    action: PowerAction,
}

/// Control plane client over HTTP
#[derive(Debug, Clone)]
pub struct HttpIsolationClient {
    config: HttpIsolationConfig,
    client: Client,
}

impl HttpIsolationClient {
    pub fn new(config: HttpIsolationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| ControlError::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn node_url(&self, target: &str) -> String {
        format!("{}/api/v1/nodes/{}", self.config.base_url, target)
    }

    fn change_url(&self, target: &str, request_id: &RequestId) -> String {
        format!("{}/changes/{}", self.node_url(target), request_id)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = self.authorize(builder).send().await?;
        let status = response.status();
        debug!(status = %status, call = what, "Control plane responded");

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, format!("{}: {} {}", what, status, body.trim())))
    }
}

/// Map an HTTP status onto the client error taxonomy
fn classify_status(status: StatusCode, message: String) -> ControlError {
    match status {
        StatusCode::CONFLICT | StatusCode::LOCKED => ControlError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS => ControlError::Throttled(message),
        StatusCode::SERVICE_UNAVAILABLE => ControlError::Busy(message),
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => ControlError::Timeout(message),
        StatusCode::BAD_GATEWAY => ControlError::Connection(message),
        StatusCode::NOT_FOUND => ControlError::NotFound(message),
        s if s.is_client_error() => ControlError::Rejected(message),
        _ => ControlError::InvalidResponse(message),
    }
}

#[async_trait]
impl NodeIsolationClient for HttpIsolationClient {
    async fn apply_change(&self, target: &str, request: &ChangeRequest) -> Result<RequestId> {
        let url = format!("{}/changes", self.node_url(target));
        let response = self
            .send(self.client.post(&url).json(request), "apply change")
            .await?;
        let accepted: RequestAccepted = response.json().await?;
        Ok(accepted.request_id)
    }

    async fn get_change_status(
        &self,
        target: &str,
        request_id: &RequestId,
    ) -> Result<ChangeStatus> {
        let url = self.change_url(target, request_id);
        let response = self.send(self.client.get(&url), "change status").await?;
        Ok(response.json().await?)
    }

    async fn is_change_failed(&self, target: &str, request_id: &RequestId) -> Result<bool> {
        let url = format!("{}/failed", self.change_url(target, request_id));
        let response = self.send(self.client.get(&url), "change failed").await?;
        let probe: FailedProbe = response.json().await?;
        Ok(probe.failed)
    }

    async fn set_power_state(&self, target: &str, action: PowerAction) -> Result<RequestId> {
        let url = format!("{}/power", self.node_url(target));
        let response = self
            .send(self.client.post(&url).json(&PowerBody { action }), "set power state")
            .await?;
        let accepted: RequestAccepted = response.json().await?;
        Ok(accepted.request_id)
    }

    async fn get_node_status(&self, target: &str, request_id: &RequestId) -> Result<NodeStatus> {
        let url = format!("{}/status", self.node_url(target));
        let response = self
            .send(
                self.client
                    .get(&url)
                    .query(&[("requestId", request_id.as_str())]),
                "node status",
            )
            .await?;
        Ok(NodeStatus::new(response.text().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> HttpIsolationClient {
        HttpIsolationClient::new(HttpIsolationConfig::new("https://isolation.test/")).unwrap()
    }

    #[test]
    fn test_config_trims_trailing_slash() {
        let client = test_client();
        assert_eq!(client.base_url(), "https://isolation.test");
    }

    #[test]
    fn test_urls() {
        let client = test_client();
        let id = RequestId::new("abc");

        assert_eq!(client.node_url("node-3"), "https://isolation.test/api/v1/nodes/node-3");
        assert_eq!(
            client.change_url("node-3", &id),
            "https://isolation.test/api/v1/nodes/node-3/changes/abc"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = HttpIsolationConfig::new("http://cp")
            .with_token("secret")
            .with_call_timeout(Duration::from_secs(5));

        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.call_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_status_classification() {
        let classify = |status| classify_status(status, String::new());

        assert!(matches!(classify(StatusCode::CONFLICT), ControlError::Conflict(_)));
        assert!(matches!(classify(StatusCode::TOO_MANY_REQUESTS), ControlError::Throttled(_)));
        assert!(matches!(classify(StatusCode::SERVICE_UNAVAILABLE), ControlError::Busy(_)));
        assert!(matches!(classify(StatusCode::NOT_FOUND), ControlError::NotFound(_)));
        assert!(matches!(classify(StatusCode::BAD_REQUEST), ControlError::Rejected(_)));
        assert!(matches!(
            classify(StatusCode::INTERNAL_SERVER_ERROR),
            ControlError::InvalidResponse(_)
        ));

        assert!(classify(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(!classify(StatusCode::BAD_REQUEST).is_transient());
    }

    #[test]
    fn test_accepted_body() {
        let accepted: RequestAccepted = serde_json::from_str(r#"{"requestId":"r-42"}"#).unwrap();
        assert_eq!(accepted.request_id.as_str(), "r-42");

        let body = serde_json::to_string(&PowerBody {
            action: PowerAction::Cycle,
        })
        .unwrap();
        assert_eq!(body, r#"{"action":"cycle"}"#);
    }
}
