//! Resource model
//!
//! Typed views of the records persisted by the API server, plus the
//! `ResourceEvent` the informer hands to reconcilers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource kinds the control plane watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Projects,
    ProjectSettings,
    Sessions,
}

impl ResourceKind {
    /// All kinds, in initial-sync order (namespaces before the sessions living in them).
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Projects,
        ResourceKind::ProjectSettings,
        ResourceKind::Sessions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Projects => "projects",
            ResourceKind::ProjectSettings => "project_settings",
            ResourceKind::Sessions => "sessions",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// No phase written yet.
    Unset,
    Pending,
    Creating,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl SessionPhase {
    /// Parse a wire phase. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(SessionPhase::Unset),
            "Pending" => Some(SessionPhase::Pending),
            "Creating" => Some(SessionPhase::Creating),
            "Running" => Some(SessionPhase::Running),
            "Stopping" => Some(SessionPhase::Stopping),
            "Stopped" => Some(SessionPhase::Stopped),
            "Completed" => Some(SessionPhase::Completed),
            "Failed" => Some(SessionPhase::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Unset => "",
            SessionPhase::Pending => "Pending",
            SessionPhase::Creating => "Creating",
            SessionPhase::Running => "Running",
            SessionPhase::Stopping => "Stopping",
            SessionPhase::Stopped => "Stopped",
            SessionPhase::Completed => "Completed",
            SessionPhase::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Stopped | SessionPhase::Completed | SessionPhase::Failed
        )
    }

    /// Phases from which a fresh runner may be started.
    pub fn is_startable(&self) -> bool {
        matches!(self, SessionPhase::Unset | SessionPhase::Pending)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agentic session record.
///
/// JSON sub-documents (`repos`, `conditions`, ...) stay as strings, the same
/// way the API stores them; reconcilers parse what they need.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub project_id: Option<String>,
    pub kube_cr_name: Option<String>,
    pub kube_cr_uid: Option<String>,
    pub kube_namespace: Option<String>,
    pub phase: Option<String>,
    pub prompt: Option<String>,
    pub repos: Option<String>,
    pub interactive: Option<bool>,
    pub timeout: Option<i64>,
    pub llm_model: Option<String>,
    pub llm_temperature: Option<f64>,
    pub llm_max_tokens: Option<i64>,
    pub environment_variables: Option<String>,
    pub created_by_user_id: Option<String>,
    pub start_time: Option<String>,
    pub completion_time: Option<String>,
    pub sdk_session_id: Option<String>,
    pub sdk_restart_count: Option<i64>,
    pub conditions: Option<String>,
    pub reconciled_repos: Option<String>,
    pub reconciled_workflow: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Session {
    /// Current phase; an unrecognised phase string yields `None`.
    pub fn phase(&self) -> Option<SessionPhase> {
        SessionPhase::parse(self.phase.as_deref().unwrap_or_default())
    }

    /// Sessions carrying a CR name belong to the cluster execution path.
    pub fn is_cluster_managed(&self) -> bool {
        self.kube_cr_name
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty())
    }
}

/// A project; maps one-to-one onto a Kubernetes namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub labels: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Per-project settings; `group_access` is a JSON list of `{group, role}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub id: String,
    pub project_id: String,
    pub group_access: Option<String>,
    pub repositories: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// A cached object of any watched kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceObject {
    Session(Session),
    Project(Project),
    ProjectSettings(ProjectSettings),
}

impl ResourceObject {
    /// Decode a wire object for the given kind.
    pub fn decode(kind: ResourceKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ResourceKind::Sessions => ResourceObject::Session(serde_json::from_value(value)?),
            ResourceKind::Projects => ResourceObject::Project(serde_json::from_value(value)?),
            ResourceKind::ProjectSettings => {
                ResourceObject::ProjectSettings(serde_json::from_value(value)?)
            }
        })
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceObject::Session(_) => ResourceKind::Sessions,
            ResourceObject::Project(_) => ResourceKind::Projects,
            ResourceObject::ProjectSettings(_) => ResourceKind::ProjectSettings,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ResourceObject::Session(s) => &s.id,
            ResourceObject::Project(p) => &p.id,
            ResourceObject::ProjectSettings(ps) => &ps.id,
        }
    }

    pub fn as_session(&self) -> Option<&Session> {
        match self {
            ResourceObject::Session(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_project(&self) -> Option<&Project> {
        match self {
            ResourceObject::Project(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_project_settings(&self) -> Option<&ProjectSettings> {
        match self {
            ResourceObject::ProjectSettings(ps) => Some(ps),
            _ => None,
        }
    }
}

/// What happened to a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ResourceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceEventType::Added => "added",
            ResourceEventType::Modified => "modified",
            ResourceEventType::Deleted => "deleted",
        })
    }
}

/// A typed cache mutation, delivered once to every reconciler of its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    pub event_type: ResourceEventType,
    pub resource: ResourceKind,
    /// For `Deleted`, the last cached value (delete payloads carry no body).
    pub object: ResourceObject,
    pub old_object: Option<ResourceObject>,
}

impl ResourceEvent {
    pub fn added(object: ResourceObject) -> Self {
        Self {
            event_type: ResourceEventType::Added,
            resource: object.kind(),
            object,
            old_object: None,
        }
    }

    pub fn modified(object: ResourceObject, old_object: Option<ResourceObject>) -> Self {
        Self {
            event_type: ResourceEventType::Modified,
            resource: object.kind(),
            object,
            old_object,
        }
    }

    pub fn deleted(object: ResourceObject) -> Self {
        Self {
            event_type: ResourceEventType::Deleted,
            resource: object.kind(),
            object,
            old_object: None,
        }
    }
}
