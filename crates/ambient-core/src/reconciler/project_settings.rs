//! ProjectSettings → RoleBindings
//!
//! One binding per `{group, role}` pair, named `ambient-<group>-<role>`, in
//! the project's namespace. `roleRef` cannot be changed on a live binding,
//! so a role change is always delete + create. Managed bindings that no
//! longer correspond to an entry are pruned.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{validate_dns_label, validate_object_name, ProjectLookup, Reconciler};
use crate::cluster::{
    optional, ClusterClient, ObjectMeta, RoleBinding, RoleRef, Subject, MANAGED_BY,
    MANAGED_BY_LABEL, PROJECT_ID_LABEL,
};
use crate::error::ValidationError;
use crate::resources::{ProjectSettings, ResourceEvent, ResourceEventType, ResourceKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAccess {
    pub group: String,
    pub role: String,
}

impl GroupAccess {
    /// Parse the `group_access` JSON list. Absent or blank means no access.
    pub fn parse_list(raw: Option<&str>) -> Result<Vec<GroupAccess>, ValidationError> {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return Ok(Vec::new());
        };
        serde_json::from_str(raw).map_err(|source| ValidationError::MalformedJson {
            field: "group_access",
            source,
        })
    }

    pub fn binding_name(&self) -> String {
        sanitize(&format!("ambient-{}-{}", self.group, self.role))
    }
}

/// Lowercase, map anything outside `[a-z0-9.-]` to `-`, trim dashes.
fn sanitize(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches(['-', '.']).to_string()
}

pub struct ProjectSettingsReconciler {
    cluster: Arc<dyn ClusterClient>,
    projects: Arc<dyn ProjectLookup>,
}

impl ProjectSettingsReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>, projects: Arc<dyn ProjectLookup>) -> Self {
        Self { cluster, projects }
    }

    async fn namespace_for(&self, settings: &ProjectSettings) -> Option<String> {
        self.projects
            .project(&settings.project_id)
            .await
            .map(|project| project.name)
    }

    fn desired(
        settings: &ProjectSettings,
        namespace: &str,
    ) -> Result<BTreeMap<String, RoleBinding>, ValidationError> {
        let mut bindings: BTreeMap<String, RoleBinding> = BTreeMap::new();
        for access in GroupAccess::parse_list(settings.group_access.as_deref())? {
            let name = access.binding_name();
            validate_object_name("role binding name", &name)?;
            if let Some(taken) = bindings.get(&name) {
                let same_pair = taken.role_ref.name == access.role
                    && taken.subjects.iter().any(|s| s.name == access.group);
                if same_pair {
                    continue;
                }
                return Err(ValidationError::BindingNameCollision {
                    name,
                    first: format!(
                        "{}/{}",
                        taken.subjects.first().map(|s| s.name.as_str()).unwrap_or_default(),
                        taken.role_ref.name
                    ),
                    second: format!("{}/{}", access.group, access.role),
                });
            }
            let labels = BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
                (PROJECT_ID_LABEL.to_string(), settings.project_id.clone()),
            ]);
            let binding = RoleBinding::new(
                ObjectMeta::namespaced(namespace, &name).with_labels(labels),
                vec![Subject::group(&access.group)],
                RoleRef::cluster_role(&access.role),
            );
            bindings.insert(name, binding);
        }
        Ok(bindings)
    }

    async fn sync(&self, settings: &ProjectSettings) -> anyhow::Result<()> {
        let namespace = self
            .namespace_for(settings)
            .await
            .with_context(|| format!("project {} is not known yet", settings.project_id))?;
        validate_dns_label("namespace", &namespace)?;
        let desired = Self::desired(settings, &namespace)?;

        for binding in desired.values() {
            self.ensure(binding).await?;
        }
        self.prune(&namespace, &settings.project_id, &desired).await
    }

    async fn ensure(&self, desired: &RoleBinding) -> anyhow::Result<()> {
        let namespace = desired.metadata.namespace();
        let name = &desired.metadata.name;

        let Some(mut existing) = optional(self.cluster.get_role_binding(namespace, name).await)?
        else {
            self.cluster
                .create_role_binding(desired)
                .await
                .with_context(|| format!("failed to create role binding {namespace}/{name}"))?;
            info!(namespace, binding = %name, role = %desired.role_ref.name, "Created role binding");
            return Ok(());
        };

        if existing.role_ref != desired.role_ref {
            self.delete(namespace, name).await?;
            self.cluster
                .create_role_binding(desired)
                .await
                .with_context(|| format!("failed to recreate role binding {namespace}/{name}"))?;
            info!(
                namespace,
                binding = %name,
                from = %existing.role_ref.name,
                to = %desired.role_ref.name,
                "Role changed; recreated role binding"
            );
            return Ok(());
        }

        let labels_drifted = desired
            .metadata
            .labels
            .iter()
            .any(|(k, v)| existing.metadata.labels.get(k) != Some(v));
        if existing.subjects == desired.subjects && !labels_drifted {
            debug!(namespace, binding = %name, "Role binding up to date");
            return Ok(());
        }

        existing.subjects = desired.subjects.clone();
        existing
            .metadata
            .labels
            .extend(desired.metadata.labels.clone());
        self.cluster
            .update_role_binding(&existing)
            .await
            .with_context(|| format!("failed to update role binding {namespace}/{name}"))?;
        info!(namespace, binding = %name, "Updated role binding subjects");
        Ok(())
    }

    /// Delete bindings this control plane created for the project that are
    /// not in `keep`.
    async fn prune(
        &self,
        namespace: &str,
        project_id: &str,
        keep: &BTreeMap<String, RoleBinding>,
    ) -> anyhow::Result<()> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY},{PROJECT_ID_LABEL}={project_id}");
        let managed = self
            .cluster
            .list_role_bindings(namespace, &selector)
            .await
            .with_context(|| format!("failed to list role bindings in {namespace}"))?;

        for binding in managed {
            if keep.contains_key(&binding.metadata.name) {
                continue;
            }
            self.delete(namespace, &binding.metadata.name).await?;
            info!(namespace, binding = %binding.metadata.name, "Pruned stale role binding");
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        match self.cluster.delete_role_binding(namespace, name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete role binding {namespace}/{name}")),
        }
    }
}

#[async_trait]
impl Reconciler for ProjectSettingsReconciler {
    fn resource(&self) -> ResourceKind {
        ResourceKind::ProjectSettings
    }

    async fn reconcile(&self, event: &ResourceEvent) -> anyhow::Result<()> {
        let settings = event
            .object
            .as_project_settings()
            .context("project settings reconciler received a different object")?;

        match event.event_type {
            ResourceEventType::Added | ResourceEventType::Modified => self.sync(settings).await,
            ResourceEventType::Deleted => {
                let Some(namespace) = self.namespace_for(settings).await else {
                    warn!(
                        project_id = %settings.project_id,
                        "Settings deleted for unknown project; nothing to prune"
                    );
                    return Ok(());
                };
                self.prune(&namespace, &settings.project_id, &BTreeMap::new())
                    .await
            }
        }
    }
}
