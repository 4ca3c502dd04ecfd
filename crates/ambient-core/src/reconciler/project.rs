//! Project → Namespace

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{validate_dns_label, Reconciler};
use crate::cluster::{
    optional, ClusterClient, Namespace, MANAGED_BY, MANAGED_BY_LABEL, MANAGED_LABEL,
    PROJECT_ID_LABEL,
};
use crate::resources::{Project, ResourceEvent, ResourceEventType, ResourceKind};

/// Keeps one labelled namespace per project. Deleting a project leaves its
/// namespace in place.
pub struct ProjectReconciler {
    cluster: Arc<dyn ClusterClient>,
}

impl ProjectReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    async fn ensure_namespace(&self, project: &Project) -> anyhow::Result<()> {
        validate_dns_label("project name", &project.name)?;
        let wanted = namespace_labels(project);

        let Some(mut existing) = optional(self.cluster.get_namespace(&project.name).await)? else {
            self.cluster
                .create_namespace(&Namespace::new(&project.name, wanted))
                .await
                .with_context(|| format!("failed to create namespace {}", project.name))?;
            info!(project_id = %project.id, namespace = %project.name, "Created namespace");
            return Ok(());
        };

        let drifted = wanted
            .iter()
            .any(|(k, v)| existing.metadata.labels.get(k) != Some(v));
        if !drifted {
            debug!(namespace = %project.name, "Namespace labels up to date");
            return Ok(());
        }

        existing.metadata.labels.extend(wanted);
        self.cluster
            .update_namespace(&existing)
            .await
            .with_context(|| format!("failed to update namespace {}", project.name))?;
        info!(project_id = %project.id, namespace = %project.name, "Updated namespace labels");
        Ok(())
    }
}

fn namespace_labels(project: &Project) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (PROJECT_ID_LABEL.to_string(), project.id.clone()),
    ])
}

#[async_trait]
impl Reconciler for ProjectReconciler {
    fn resource(&self) -> ResourceKind {
        ResourceKind::Projects
    }

    async fn reconcile(&self, event: &ResourceEvent) -> anyhow::Result<()> {
        let project = event
            .object
            .as_project()
            .context("project reconciler received a non-project object")?;

        match event.event_type {
            ResourceEventType::Added | ResourceEventType::Modified => {
                self.ensure_namespace(project).await
            }
            ResourceEventType::Deleted => {
                info!(
                    project_id = %project.id,
                    namespace = %project.name,
                    "Project deleted; namespace left in place"
                );
                Ok(())
            }
        }
    }
}
