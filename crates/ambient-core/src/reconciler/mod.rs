//! Reconcilers
//!
//! One reconciler per resource kind and execution mode. Each translates a
//! cached object plus an event into a mutation of the execution substrate.
//! Every `reconcile` must be safe to re-run against a replayed `Added` event.

mod local_session;
mod project;
mod project_settings;
mod session;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{ApiClient, SessionStatusPatch};
use crate::cluster::RepoSpec;
use crate::error::ValidationError;
use crate::resources::{Project, ResourceEvent, ResourceKind};

pub use local_session::{LocalSessionConfig, LocalSessionReconciler};
pub use project::ProjectReconciler;
pub use project_settings::{GroupAccess, ProjectSettingsReconciler};
pub use session::SessionReconciler;

#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The kind this reconciler handles.
    fn resource(&self) -> ResourceKind;

    async fn reconcile(&self, event: &ResourceEvent) -> anyhow::Result<()>;
}

/// Resolves projects by id. The informer cache is the production source.
#[async_trait]
pub trait ProjectLookup: Send + Sync {
    async fn project(&self, id: &str) -> Option<Project>;
}

/// Last `updated_at` the control plane itself wrote for each session.
///
/// A Modified event carrying exactly that timestamp is our own status write
/// coming back through the watch; acting on it would loop forever.
#[derive(Debug, Default)]
pub struct WriteBackMarkers {
    markers: Mutex<HashMap<String, String>>,
}

impl WriteBackMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session_id: &str, updated_at: &str) {
        self.markers
            .lock()
            .insert(session_id.to_string(), updated_at.to_string());
    }

    pub fn is_echo(&self, session_id: &str, updated_at: Option<&str>) -> bool {
        let Some(updated_at) = updated_at else {
            return false;
        };
        self.markers
            .lock()
            .get(session_id)
            .is_some_and(|marker| marker == updated_at)
    }

    pub fn forget(&self, session_id: &str) {
        self.markers.lock().remove(session_id);
    }

    pub fn get(&self, session_id: &str) -> Option<String> {
        self.markers.lock().get(session_id).cloned()
    }
}

/// Push a status patch and remember the resulting `updated_at`.
pub(crate) async fn write_session_status(
    api: &Arc<dyn ApiClient>,
    markers: &WriteBackMarkers,
    session_id: &str,
    patch: SessionStatusPatch,
) -> anyhow::Result<()> {
    if patch.is_empty() {
        return Ok(());
    }
    let updated = api.update_session_status(session_id, &patch).await?;
    match updated.updated_at.as_deref() {
        Some(updated_at) => markers.record(session_id, updated_at),
        None => tracing::debug!(session_id, "Status write returned no updated_at"),
    }
    tracing::debug!(session_id, phase = ?patch.phase, "Session status written");
    Ok(())
}

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("valid regex")
});

/// RFC 1123 label: namespaces.
pub(crate) fn validate_dns_label(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 || !DNS_LABEL.is_match(value) {
        return Err(ValidationError::InvalidDnsLabel {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// RFC 1123 subdomain: most other object names.
pub(crate) fn validate_object_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.len() > 253 || !DNS_SUBDOMAIN.is_match(value) {
        return Err(ValidationError::InvalidName {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// A `repos` entry is either a bare URL or `{url, branch}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RepoEntry {
    Url(String),
    Spec(RepoSpec),
}

/// Parse a session's `repos` JSON list. Absent or blank means no repos.
pub(crate) fn parse_repos(raw: Option<&str>) -> Result<Vec<RepoSpec>, ValidationError> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    let entries: Vec<RepoEntry> = serde_json::from_str(raw)
        .map_err(|source| ValidationError::MalformedJson { field: "repos", source })?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            RepoEntry::Url(url) => RepoSpec { url, branch: None },
            RepoEntry::Spec(spec) => spec,
        })
        .collect())
}

/// Parse a session's `environment_variables` JSON object. Non-string values
/// are passed through in their JSON form.
pub(crate) fn parse_env_vars(raw: Option<&str>) -> Result<BTreeMap<String, String>, ValidationError> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(BTreeMap::new());
    };
    let map: BTreeMap<String, Value> = serde_json::from_str(raw).map_err(|source| {
        ValidationError::MalformedJson {
            field: "environment_variables",
            source,
        }
    })?;
    Ok(map
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}
