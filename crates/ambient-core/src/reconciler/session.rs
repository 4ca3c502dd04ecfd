//! Session → AgenticSession CR

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    parse_env_vars, parse_repos, validate_dns_label, validate_object_name, write_session_status,
    ProjectLookup, Reconciler, WriteBackMarkers,
};
use crate::api::{ApiClient, SessionStatusPatch};
use crate::cluster::{
    optional, AgenticSession, AgenticSessionSpec, ClusterClient, LlmSettings, ObjectMeta,
    MANAGED_BY, MANAGED_BY_LABEL, PROJECT_ID_LABEL, SESSION_ID_LABEL,
};
use crate::error::{ClusterError, ValidationError};
use crate::resources::{ResourceEvent, ResourceEventType, ResourceKind, Session};

pub struct SessionReconciler {
    api: Arc<dyn ApiClient>,
    cluster: Arc<dyn ClusterClient>,
    projects: Arc<dyn ProjectLookup>,
    markers: Arc<WriteBackMarkers>,
    default_namespace: String,
}

impl SessionReconciler {
    pub fn new(
        api: Arc<dyn ApiClient>,
        cluster: Arc<dyn ClusterClient>,
        projects: Arc<dyn ProjectLookup>,
        markers: Arc<WriteBackMarkers>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            api,
            cluster,
            projects,
            markers,
            default_namespace: default_namespace.into(),
        }
    }

    /// `kube_namespace`, else the owning project's namespace, else the default.
    async fn namespace_for(&self, session: &Session) -> String {
        if let Some(ns) = non_blank(session.kube_namespace.as_deref()) {
            return ns.to_string();
        }
        if let Some(project_id) = non_blank(session.project_id.as_deref()) {
            if let Some(project) = self.projects.project(project_id).await {
                return project.name;
            }
            debug!(session_id = %session.id, project_id, "Project not cached, using default namespace");
        }
        self.default_namespace.clone()
    }

    /// Create or update the CR, then mirror its status onto the session.
    async fn apply(&self, session: &Session) -> anyhow::Result<()> {
        let name = cr_name(session);
        validate_object_name("session CR name", &name)?;
        let namespace = self.namespace_for(session).await;
        validate_dns_label("namespace", &namespace)?;
        let spec = build_spec(session, &name, &namespace)?;
        let labels = cr_labels(session);

        let applied = match optional(self.cluster.get_agentic_session(&namespace, &name).await)? {
            Some(existing) => self.update(existing, spec, labels).await?,
            None => {
                let cr = AgenticSession::new(
                    ObjectMeta::namespaced(&namespace, &name).with_labels(labels.clone()),
                    spec.clone(),
                );
                match self.cluster.create_agentic_session(&cr).await {
                    Ok(created) => {
                        info!(session_id = %session.id, namespace = %namespace, cr = %name, "Created AgenticSession");
                        created
                    }
                    // Lost a race with another writer; fall back to update.
                    Err(ClusterError::Conflict(_)) => {
                        let existing = self.cluster.get_agentic_session(&namespace, &name).await?;
                        self.update(existing, spec, labels).await?
                    }
                    Err(e) => return Err(e).context("failed to create AgenticSession"),
                }
            }
        };

        let patch = status_patch(session, &applied, &namespace);
        write_session_status(&self.api, &self.markers, &session.id, patch).await
    }

    async fn update(
        &self,
        mut existing: AgenticSession,
        spec: AgenticSessionSpec,
        labels: BTreeMap<String, String>,
    ) -> anyhow::Result<AgenticSession> {
        existing.spec = spec;
        existing.metadata.labels.extend(labels);
        let updated = self
            .cluster
            .update_agentic_session(&existing)
            .await
            .context("failed to update AgenticSession")?;
        debug!(namespace = %updated.metadata.namespace(), cr = %updated.metadata.name, "Updated AgenticSession");
        Ok(updated)
    }

    async fn delete(&self, session: &Session) -> anyhow::Result<()> {
        let name = cr_name(session);
        let namespace = self.namespace_for(session).await;
        match self.cluster.delete_agentic_session(&namespace, &name).await {
            Ok(()) => info!(session_id = %session.id, namespace = %namespace, cr = %name, "Deleted AgenticSession"),
            Err(e) if e.is_not_found() => {
                debug!(session_id = %session.id, cr = %name, "AgenticSession already gone")
            }
            Err(e) => return Err(e).context("failed to delete AgenticSession"),
        }
        self.markers.forget(&session.id);
        Ok(())
    }
}

#[async_trait]
impl Reconciler for SessionReconciler {
    fn resource(&self) -> ResourceKind {
        ResourceKind::Sessions
    }

    async fn reconcile(&self, event: &ResourceEvent) -> anyhow::Result<()> {
        let session = event
            .object
            .as_session()
            .context("session reconciler received a non-session object")?;

        match event.event_type {
            ResourceEventType::Added => self.apply(session).await,
            ResourceEventType::Modified => {
                if self
                    .markers
                    .is_echo(&session.id, session.updated_at.as_deref())
                {
                    debug!(session_id = %session.id, "Ignoring echo of our own status write");
                    return Ok(());
                }
                self.apply(session).await
            }
            ResourceEventType::Deleted => self.delete(session).await,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn cr_name(session: &Session) -> String {
    non_blank(session.kube_cr_name.as_deref())
        .unwrap_or(&session.id)
        .to_lowercase()
}

fn cr_labels(session: &Session) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (SESSION_ID_LABEL.to_string(), session.id.clone()),
    ]);
    if let Some(project_id) = non_blank(session.project_id.as_deref()) {
        labels.insert(PROJECT_ID_LABEL.to_string(), project_id.to_string());
    }
    labels
}

fn build_spec(
    session: &Session,
    cr_name: &str,
    namespace: &str,
) -> Result<AgenticSessionSpec, ValidationError> {
    let default_branch = format!("ambient/{cr_name}");
    let repos = parse_repos(session.repos.as_deref())?
        .into_iter()
        .map(|mut repo| {
            if repo.branch.as_deref().map_or(true, |b| b.trim().is_empty()) {
                repo.branch = Some(default_branch.clone());
            }
            repo
        })
        .collect();

    Ok(AgenticSessionSpec {
        display_name: non_blank(Some(&session.name)).map(str::to_string),
        project: Some(namespace.to_string()),
        initial_prompt: session.prompt.clone(),
        interactive: session.interactive.unwrap_or(false),
        timeout: session.timeout,
        llm_settings: LlmSettings {
            model: session.llm_model.clone(),
            temperature: session.llm_temperature,
            max_tokens: session.llm_max_tokens,
        },
        repos,
        environment_variables: parse_env_vars(session.environment_variables.as_deref())?,
        created_by: session.created_by_user_id.clone(),
    })
}

/// Only fields the CR has populated and the session does not already hold.
fn status_patch(session: &Session, cr: &AgenticSession, namespace: &str) -> SessionStatusPatch {
    fn changed(new: Option<String>, current: &Option<String>) -> Option<String> {
        new.filter(|v| !v.is_empty() && Some(v) != current.as_ref())
    }

    let mut patch = SessionStatusPatch {
        kube_cr_uid: changed(cr.metadata.uid.clone(), &session.kube_cr_uid),
        kube_namespace: changed(Some(namespace.to_string()), &session.kube_namespace),
        ..Default::default()
    };
    let Some(status) = &cr.status else {
        return patch;
    };

    patch.phase = changed(status.phase.clone(), &session.phase);
    patch.start_time = changed(status.start_time.clone(), &session.start_time);
    patch.completion_time = changed(status.completion_time.clone(), &session.completion_time);
    patch.sdk_session_id = changed(status.sdk_session_id.clone(), &session.sdk_session_id);
    patch.sdk_restart_count = status
        .sdk_restart_count
        .filter(|count| Some(*count) != session.sdk_restart_count);
    if !status.conditions.is_empty() {
        let encoded = serde_json::to_string(&status.conditions).ok();
        patch.conditions = changed(encoded, &session.conditions);
    }
    patch.reconciled_repos = changed(
        status.reconciled_repos.as_ref().map(|v| v.to_string()),
        &session.reconciled_repos,
    );
    patch.reconciled_workflow = changed(
        status.reconciled_workflow.as_ref().map(|v| v.to_string()),
        &session.reconciled_workflow,
    );
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::AgenticSessionStatus;
    use crate::resources::ResourceObject;
    use crate::testing::{session, FakeApiClient, FakeClusterClient, StaticProjects};

    struct Harness {
        api: Arc<FakeApiClient>,
        cluster: Arc<FakeClusterClient>,
        markers: Arc<WriteBackMarkers>,
        reconciler: SessionReconciler,
    }

    fn harness() -> Harness {
        let api = Arc::new(FakeApiClient::default());
        let cluster = Arc::new(FakeClusterClient::default());
        let markers = Arc::new(WriteBackMarkers::new());
        let reconciler = SessionReconciler::new(
            api.clone(),
            cluster.clone(),
            Arc::new(StaticProjects::default().with("p1", "team-a")),
            markers.clone(),
            "ambient-code",
        );
        Harness {
            api,
            cluster,
            markers,
            reconciler,
        }
    }

    fn project_session() -> Session {
        Session {
            project_id: Some("p1".into()),
            kube_cr_name: Some("My-Session".into()),
            prompt: Some("fix the build".into()),
            repos: Some(
                r#"[{"url": "https://git.example/a.git"}, {"url": "https://git.example/b.git", "branch": "main"}]"#
                    .into(),
            ),
            ..session("s1", "Pending")
        }
    }

    fn added(session: Session) -> ResourceEvent {
        ResourceEvent::added(ResourceObject::Session(session))
    }

    fn modified(session: Session) -> ResourceEvent {
        ResourceEvent::modified(ResourceObject::Session(session), None)
    }

    #[tokio::test]
    async fn added_creates_cr_and_writes_back_location() {
        let h = harness();
        h.reconciler.reconcile(&added(project_session())).await.unwrap();

        let cr = h.cluster.agentic_session("team-a", "my-session").expect("CR created");
        assert_eq!(cr.spec.repos[0].branch.as_deref(), Some("ambient/my-session"));
        assert_eq!(cr.spec.repos[1].branch.as_deref(), Some("main"));
        assert_eq!(cr.spec.initial_prompt.as_deref(), Some("fix the build"));
        assert_eq!(cr.metadata.labels[SESSION_ID_LABEL], "s1");

        let patches = h.api.patches_for("s1");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].kube_cr_uid.as_deref(), Some("uid-my-session"));
        assert_eq!(patches[0].kube_namespace.as_deref(), Some("team-a"));
        assert!(patches[0].phase.is_none(), "no CR status yet");
        assert!(h.markers.get("s1").is_some());
    }

    #[tokio::test]
    async fn replayed_added_updates_existing_cr() {
        let h = harness();
        h.reconciler.reconcile(&added(project_session())).await.unwrap();
        h.cluster.clear_calls();

        h.reconciler.reconcile(&added(project_session())).await.unwrap();
        assert_eq!(h.cluster.calls(), vec!["update agenticsession team-a/my-session"]);
    }

    #[tokio::test]
    async fn echo_of_own_write_is_a_no_op() {
        let h = harness();
        h.reconciler.reconcile(&added(project_session())).await.unwrap();
        h.cluster.clear_calls();
        let writes_before = h.api.patches().len();

        let echo = Session {
            updated_at: h.markers.get("s1"),
            ..project_session()
        };
        h.reconciler.reconcile(&modified(echo)).await.unwrap();

        assert!(h.cluster.calls().is_empty());
        assert_eq!(h.api.patches().len(), writes_before);
    }

    #[tokio::test]
    async fn operator_status_is_copied_sparsely() {
        let h = harness();
        h.reconciler.reconcile(&added(project_session())).await.unwrap();
        h.cluster.set_session_status(
            "team-a",
            "my-session",
            AgenticSessionStatus {
                phase: Some("Running".into()),
                start_time: Some("2024-05-01T10:00:00Z".into()),
                ..Default::default()
            },
        );

        let external_edit = Session {
            kube_cr_uid: Some("uid-my-session".into()),
            kube_namespace: Some("team-a".into()),
            updated_at: Some("2024-05-01T10:00:05Z".into()),
            ..project_session()
        };
        h.reconciler.reconcile(&modified(external_edit)).await.unwrap();

        let patch = h.api.patches_for("s1").pop().expect("status patch");
        assert_eq!(patch.phase.as_deref(), Some("Running"));
        assert_eq!(patch.start_time.as_deref(), Some("2024-05-01T10:00:00Z"));
        assert!(patch.completion_time.is_none());
        assert!(patch.kube_cr_uid.is_none(), "unchanged fields are omitted");
        assert!(patch.kube_namespace.is_none());
        let json = serde_json::to_value(&patch).unwrap();
        assert!(json.get("conditions").is_none());
    }

    #[tokio::test]
    async fn modified_recreates_missing_cr() {
        let h = harness();
        let s = Session {
            updated_at: Some("2024-05-01T00:00:00Z".into()),
            ..session("Plain-ID", "Pending")
        };
        h.reconciler.reconcile(&modified(s)).await.unwrap();
        assert_eq!(h.cluster.calls(), vec!["create agenticsession ambient-code/plain-id"]);
    }

    #[tokio::test]
    async fn delete_tolerates_missing_cr_and_forgets_marker() {
        let h = harness();
        h.markers.record("s1", "2024-01-01T00:00:00Z");
        let event = ResourceEvent::deleted(ResourceObject::Session(project_session()));

        h.reconciler.reconcile(&event).await.unwrap();
        assert!(h.markers.get("s1").is_none());
        assert_eq!(h.cluster.calls(), vec!["delete agenticsession team-a/my-session"]);
    }

    #[tokio::test]
    async fn malformed_repos_fail_permanently() {
        let h = harness();
        let bad = Session {
            repos: Some("not json".into()),
            ..project_session()
        };
        let err = h.reconciler.reconcile(&added(bad)).await.unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        assert!(h.cluster.calls().is_empty());
    }
}
