//! Diagnostics collection sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::Result;

/// Request to collect forensic data for a time window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsRequest {
    pub experiment_id: String,
    pub issue_type: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,

    /// Target identity, correlation id and step identity
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DiagnosticsRequest {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Destination for diagnostics requests
///
/// Fire-and-forget from the caller's perspective: an error only means the
/// request could not be handed over.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn request(&self, request: DiagnosticsRequest) -> Result<()>;
}

/// Sink that only records requests in the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnosticsSink;

#[async_trait]
impl DiagnosticsSink for TracingDiagnosticsSink {
    async fn request(&self, request: DiagnosticsRequest) -> Result<()> {
        info!(
            experiment = %request.experiment_id,
            issue = %request.issue_type,
            window_start = %request.window_start,
            window_end = %request.window_end,
            target = request.metadata("target").unwrap_or(""),
            correlation_id = request.metadata("correlation_id").unwrap_or(""),
            "Diagnostics requested"
        );
        Ok(())
    }
}
