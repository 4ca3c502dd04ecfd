//! Cluster API surface used by the cluster-mode reconcilers
//!
//! Only the slices of `Namespace`, `RoleBinding` and `AgenticSession` the
//! control plane reads or writes are modelled; unknown fields are dropped.

mod rest;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClusterError;

pub use rest::KubeRestClient;

pub const MANAGED_LABEL: &str = "ambient-code.io/managed";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "ambient-control-plane";
pub const PROJECT_ID_LABEL: &str = "ambient-code.io/project-id";
pub const SESSION_ID_LABEL: &str = "ambient-code.io/session-id";

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
pub const SESSION_API_GROUP: &str = "vteam.ambient-code";
pub const SESSION_API_VERSION: &str = "v1alpha1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    #[serde(default = "Namespace::api_version")]
    pub api_version: String,
    #[serde(default = "Namespace::kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
}

impl Namespace {
    fn api_version() -> String {
        "v1".to_string()
    }

    fn kind() -> String {
        "Namespace".to_string()
    }

    pub fn new(name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            api_version: Self::api_version(),
            kind: Self::kind(),
            metadata: ObjectMeta::named(name).with_labels(labels),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Subject {
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            kind: "Group".to_string(),
            name: name.into(),
            api_group: Some(RBAC_API_GROUP.to_string()),
            namespace: None,
        }
    }
}

/// Immutable once the binding exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

impl RoleRef {
    pub fn cluster_role(name: impl Into<String>) -> Self {
        Self {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    #[serde(default = "RoleBinding::api_version")]
    pub api_version: String,
    #[serde(default = "RoleBinding::kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

impl RoleBinding {
    fn api_version() -> String {
        format!("{RBAC_API_GROUP}/v1")
    }

    fn kind() -> String {
        "RoleBinding".to_string()
    }

    pub fn new(metadata: ObjectMeta, subjects: Vec<Subject>, role_ref: RoleRef) -> Self {
        Self {
            api_version: Self::api_version(),
            kind: Self::kind(),
            metadata,
            subjects,
            role_ref,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub llm_settings: LlmSettings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Written by the operator; read back into the session record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_restart_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_repos: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_workflow: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSession {
    #[serde(default = "AgenticSession::api_version")]
    pub api_version: String,
    #[serde(default = "AgenticSession::kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AgenticSessionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgenticSessionStatus>,
}

impl AgenticSession {
    fn api_version() -> String {
        format!("{SESSION_API_GROUP}/{SESSION_API_VERSION}")
    }

    fn kind() -> String {
        "AgenticSession".to_string()
    }

    pub fn new(metadata: ObjectMeta, spec: AgenticSessionSpec) -> Self {
        Self {
            api_version: Self::api_version(),
            kind: Self::kind(),
            metadata,
            spec,
            status: None,
        }
    }
}

/// Cluster operations the reconcilers need. Gets of missing objects return
/// `ClusterError::NotFound`; updates are unconditional (last write wins).
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError>;
    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError>;

    async fn get_role_binding(&self, namespace: &str, name: &str)
        -> Result<RoleBinding, ClusterError>;
    async fn list_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<RoleBinding>, ClusterError>;
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, ClusterError>;
    async fn update_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, ClusterError>;
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_agentic_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AgenticSession, ClusterError>;
    async fn create_agentic_session(
        &self,
        session: &AgenticSession,
    ) -> Result<AgenticSession, ClusterError>;
    async fn update_agentic_session(
        &self,
        session: &AgenticSession,
    ) -> Result<AgenticSession, ClusterError>;
    async fn delete_agentic_session(&self, namespace: &str, name: &str)
        -> Result<(), ClusterError>;
}

/// Turn a not-found error into `None`.
pub fn optional<T>(result: Result<T, ClusterError>) -> Result<Option<T>, ClusterError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Label selector matching everything this control plane manages.
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_binding_serializes_like_the_api_expects() {
        let binding = RoleBinding::new(
            ObjectMeta::namespaced("team-a", "ambient-dev-edit"),
            vec![Subject::group("dev")],
            RoleRef::cluster_role("edit"),
        );
        let value = serde_json::to_value(&binding).unwrap();
        assert_eq!(value["apiVersion"], "rbac.authorization.k8s.io/v1");
        assert_eq!(value["kind"], "RoleBinding");
        assert_eq!(value["roleRef"]["kind"], "ClusterRole");
        assert_eq!(value["subjects"][0]["apiGroup"], "rbac.authorization.k8s.io");
        assert!(value["metadata"].get("labels").is_none());
    }

    #[test]
    fn agentic_session_status_tolerates_operator_fields() {
        let cr: AgenticSession = serde_json::from_value(json!({
            "metadata": {"name": "s1", "namespace": "team-a", "uid": "u-1"},
            "spec": {"initialPrompt": "hi", "llmSettings": {"model": "m"}},
            "status": {
                "phase": "Running",
                "startTime": "2024-05-01T10:00:00Z",
                "conditions": [{"type": "Ready", "status": "True"}],
                "somethingNew": 1
            }
        }))
        .unwrap();

        assert_eq!(cr.api_version, "vteam.ambient-code/v1alpha1");
        assert_eq!(cr.metadata.uid.as_deref(), Some("u-1"));
        let status = cr.status.unwrap();
        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn optional_maps_only_not_found() {
        assert!(matches!(
            optional::<()>(Err(ClusterError::NotFound("x".into()))),
            Ok(None)
        ));
        assert!(optional::<()>(Err(ClusterError::Conflict("x".into()))).is_err());
    }
}
