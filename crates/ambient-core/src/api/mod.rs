//! Ambient API client
//!
//! The control plane only reads records, patches session status and
//! consumes watch streams; everything else lives behind the API server.

mod http;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::resources::{ResourceKind, ResourceObject, Session, SessionPhase};

pub use http::HttpApiClient;

/// One page of a list call.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<ResourceObject>,
    /// Total number of records of this kind, across all pages.
    pub total: usize,
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    /// List one page (1-based) of records of `kind`.
    async fn list(&self, kind: ResourceKind, page: u32, size: u32) -> Result<ListPage, ApiError>;

    /// PATCH a session's status; only the keys present in `patch` change.
    /// Returns the updated session so the caller can record its `updated_at`.
    async fn update_session_status(
        &self,
        session_id: &str,
        patch: &SessionStatusPatch,
    ) -> Result<Session, ApiError>;
}

/// Sparse session status update. `None` fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_restart_count: Option<i64>,
    /// JSON-encoded condition list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled_repos: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled_workflow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_cr_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_namespace: Option<String>,
}

impl SessionStatusPatch {
    pub fn phase(phase: SessionPhase) -> Self {
        Self {
            phase: Some(phase.as_str().to_string()),
            ..Default::default()
        }
    }

    pub fn with_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(timestamp(at));
        self
    }

    pub fn with_completion_time(mut self, at: DateTime<Utc>) -> Self {
        self.completion_time = Some(timestamp(at));
        self
    }

    pub fn with_conditions(mut self, conditions: &[Condition]) -> Self {
        self.conditions = serde_json::to_string(conditions).ok();
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Kubernetes-style status condition, stored JSON-encoded on the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(timestamp(Utc::now())),
        }
    }
}

/// RFC 3339 with second precision, the format the API stores.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_patch_is_sparse_on_the_wire() {
        let patch = SessionStatusPatch::phase(SessionPhase::Running);
        let json = serde_json::to_value(&patch).expect("serialize");
        assert_eq!(json, serde_json::json!({"phase": "Running"}));
        assert!(!patch.is_empty());
        assert!(SessionStatusPatch::default().is_empty());
    }

    #[test]
    fn conditions_are_json_encoded() {
        let patch = SessionStatusPatch::phase(SessionPhase::Failed).with_conditions(&[
            Condition::new("Ready", false, "RunnerExited", "exit code 3"),
        ]);
        let encoded = patch.conditions.expect("conditions set");
        let decoded: Vec<Condition> = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded[0].condition_type, "Ready");
        assert_eq!(decoded[0].status, "False");
        assert_eq!(decoded[0].reason, "RunnerExited");
    }
}
