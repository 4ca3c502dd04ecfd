//! In-memory fakes shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::api::{ApiClient, ListPage, SessionStatusPatch};
use crate::cluster::{AgenticSession, AgenticSessionStatus, ClusterClient, Namespace, RoleBinding};
use crate::error::{ApiError, ClusterError};
use crate::reconciler::{ProjectLookup, Reconciler};
use crate::resources::{Project, ResourceEvent, ResourceKind, ResourceObject, Session};
use crate::watch::{WatchEvent, WatchHandler, WatchSource, WatchStream, WireWatchEvent};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn session_value(id: &str, phase: &str) -> Value {
    json!({
        "id": id,
        "name": id,
        "phase": phase,
        "updated_at": "2024-01-01T00:00:00Z"
    })
}

pub fn session(id: &str, phase: &str) -> Session {
    serde_json::from_value(session_value(id, phase)).expect("valid session")
}

/// Collects items and lets a test wait until enough have arrived.
struct Recorder<T> {
    items: Mutex<Vec<T>>,
    notify: Notify,
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }
}

impl<T: Clone> Recorder<T> {
    fn push(&self, item: T) {
        self.items.lock().push(item);
        self.notify.notify_waiters();
    }

    fn snapshot(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    async fn wait_for(&self, count: usize) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.items.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count} items"));
    }
}

// ---------------------------------------------------------------------------
// API

#[derive(Default)]
pub struct FakeApiClient {
    records: Mutex<HashMap<ResourceKind, Vec<Value>>>,
    totals: Mutex<HashMap<ResourceKind, usize>>,
    list_calls: Mutex<HashMap<ResourceKind, Vec<u32>>>,
    fail_lists: AtomicBool,
    patches: Mutex<Vec<(String, SessionStatusPatch)>>,
    writes: AtomicU64,
}

impl FakeApiClient {
    pub fn seed(&self, kind: ResourceKind, value: Value) {
        self.records.lock().entry(kind).or_default().push(value);
    }

    /// Report `total` regardless of how many records exist.
    pub fn override_total(&self, kind: ResourceKind, total: usize) {
        self.totals.lock().insert(kind, total);
    }

    pub fn fail_lists(&self) {
        self.fail_lists.store(true, Ordering::SeqCst);
    }

    pub fn list_calls(&self, kind: ResourceKind) -> Vec<u32> {
        self.list_calls.lock().get(&kind).cloned().unwrap_or_default()
    }

    pub fn patches(&self) -> Vec<(String, SessionStatusPatch)> {
        self.patches.lock().clone()
    }

    pub fn patches_for(&self, session_id: &str) -> Vec<SessionStatusPatch> {
        self.patches
            .lock()
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, patch)| patch.clone())
            .collect()
    }

    /// Phases written for `session_id`, in order.
    pub fn phases_for(&self, session_id: &str) -> Vec<String> {
        self.patches_for(session_id)
            .into_iter()
            .filter_map(|patch| patch.phase)
            .collect()
    }
}

#[async_trait]
impl ApiClient for FakeApiClient {
    async fn list(&self, kind: ResourceKind, page: u32, size: u32) -> Result<ListPage, ApiError> {
        self.list_calls.lock().entry(kind).or_default().push(page);
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }

        let records = self.records.lock().get(&kind).cloned().unwrap_or_default();
        let total = self
            .totals
            .lock()
            .get(&kind)
            .copied()
            .unwrap_or(records.len());
        let start = (page.saturating_sub(1) as usize) * size as usize;
        let items = records
            .into_iter()
            .skip(start)
            .take(size as usize)
            .map(|value| ResourceObject::decode(kind, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ListPage { items, total })
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        patch: &SessionStatusPatch,
    ) -> Result<Session, ApiError> {
        self.patches
            .lock()
            .push((session_id.to_string(), patch.clone()));
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session {
            id: session_id.to_string(),
            phase: patch.phase.clone(),
            updated_at: Some(format!("2024-06-01T00:00:00.{n:06}Z")),
            ..Session::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Watch

/// Scripted streams are served once, then stay open and silent.
#[derive(Default)]
pub struct FakeWatchSource {
    failing: bool,
    scripts: Mutex<HashMap<ResourceKind, Vec<WireWatchEvent>>>,
    served: Mutex<HashSet<ResourceKind>>,
    opens: Mutex<HashMap<ResourceKind, Vec<Instant>>>,
}

impl FakeWatchSource {
    /// Every stream opens and then never yields.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Every open fails.
    pub fn always_failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn scripted(kind: ResourceKind, events: Vec<WireWatchEvent>) -> Self {
        let source = Self::default();
        source.scripts.lock().insert(kind, events);
        source
    }

    /// Serve the scripts again on the next open.
    pub fn rewind(&self) {
        self.served.lock().clear();
    }

    pub fn open_times(&self, kind: ResourceKind) -> Vec<Instant> {
        self.opens.lock().get(&kind).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl WatchSource for FakeWatchSource {
    async fn open(&self, kind: ResourceKind) -> Result<WatchStream, ApiError> {
        self.opens.lock().entry(kind).or_default().push(Instant::now());
        if self.failing {
            return Err(ApiError::Status {
                status: 503,
                body: "watch unavailable".into(),
            });
        }

        let script = if self.served.lock().insert(kind) {
            self.scripts.lock().get(&kind).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(stream::iter(script.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed())
    }
}

#[derive(Default)]
pub struct RecordingWatchHandler {
    events: Recorder<WatchEvent>,
}

impl RecordingWatchHandler {
    pub fn events(&self) -> Vec<WatchEvent> {
        self.events.snapshot()
    }

    pub async fn wait_for(&self, count: usize) {
        self.events.wait_for(count).await
    }
}

#[async_trait]
impl WatchHandler for RecordingWatchHandler {
    async fn handle(&self, event: WatchEvent) -> anyhow::Result<()> {
        self.events.push(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconcilers and lookups

pub struct RecordingReconciler {
    kind: ResourceKind,
    fail: bool,
    events: Recorder<ResourceEvent>,
}

impl RecordingReconciler {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            fail: false,
            events: Recorder::default(),
        }
    }

    /// Records every event and then reports failure.
    pub fn failing(kind: ResourceKind) -> Self {
        Self {
            fail: true,
            ..Self::new(kind)
        }
    }

    pub fn events(&self) -> Vec<ResourceEvent> {
        self.events.snapshot()
    }

    pub async fn wait_for(&self, count: usize) {
        self.events.wait_for(count).await
    }
}

#[async_trait]
impl Reconciler for RecordingReconciler {
    fn resource(&self) -> ResourceKind {
        self.kind
    }

    async fn reconcile(&self, event: &ResourceEvent) -> anyhow::Result<()> {
        self.events.push(event.clone());
        if self.fail {
            anyhow::bail!("reconcile failed on purpose");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticProjects {
    projects: HashMap<String, Project>,
}

impl StaticProjects {
    pub fn with(mut self, id: &str, name: &str) -> Self {
        self.projects.insert(
            id.to_string(),
            Project {
                id: id.to_string(),
                name: name.to_string(),
                ..Project::default()
            },
        );
        self
    }
}

#[async_trait]
impl ProjectLookup for StaticProjects {
    async fn project(&self, id: &str) -> Option<Project> {
        self.projects.get(id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Cluster

type Key = (String, String);

/// Cluster state kept in maps. Writes are logged as `"<verb> <kind> <ns>/<name>"`.
#[derive(Default)]
pub struct FakeClusterClient {
    namespaces: Mutex<HashMap<String, Namespace>>,
    role_bindings: Mutex<HashMap<Key, RoleBinding>>,
    sessions: Mutex<HashMap<Key, AgenticSession>>,
    calls: Mutex<Vec<String>>,
}

impl FakeClusterClient {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.namespaces.lock().get(name).cloned()
    }

    pub fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
        self.role_bindings
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn role_binding_names(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .role_bindings
            .lock()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn agentic_session(&self, namespace: &str, name: &str) -> Option<AgenticSession> {
        self.sessions
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Simulate the operator writing CR status.
    pub fn set_session_status(&self, namespace: &str, name: &str, status: AgenticSessionStatus) {
        if let Some(cr) = self
            .sessions
            .lock()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            cr.status = Some(status);
        }
    }

    fn record(&self, verb: &str, kind: &str, namespace: &str, name: &str) {
        self.calls
            .lock()
            .push(format!("{verb} {kind} {namespace}/{name}"));
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|actual| actual == v),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError> {
        self.namespaces
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        let name = namespace.metadata.name.clone();
        self.record("create", "namespace", "", &name);
        let mut namespaces = self.namespaces.lock();
        if namespaces.contains_key(&name) {
            return Err(ClusterError::Conflict(name));
        }
        namespaces.insert(name, namespace.clone());
        Ok(namespace.clone())
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        let name = namespace.metadata.name.clone();
        self.record("update", "namespace", "", &name);
        let mut namespaces = self.namespaces.lock();
        let slot = namespaces
            .get_mut(&name)
            .ok_or_else(|| ClusterError::NotFound(name.clone()))?;
        *slot = namespace.clone();
        Ok(namespace.clone())
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<RoleBinding, ClusterError> {
        self.role_bindings
            .lock()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn list_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<RoleBinding>, ClusterError> {
        Ok(self
            .role_bindings
            .lock()
            .iter()
            .filter(|((ns, _), rb)| {
                ns == namespace && matches_selector(&rb.metadata.labels, label_selector)
            })
            .map(|(_, rb)| rb.clone())
            .collect())
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, ClusterError> {
        let ns = binding.metadata.namespace().to_string();
        let name = binding.metadata.name.clone();
        self.record("create", "rolebinding", &ns, &name);
        let mut bindings = self.role_bindings.lock();
        if bindings.contains_key(&key(&ns, &name)) {
            return Err(ClusterError::Conflict(name));
        }
        bindings.insert(key(&ns, &name), binding.clone());
        Ok(binding.clone())
    }

    async fn update_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, ClusterError> {
        let ns = binding.metadata.namespace().to_string();
        let name = binding.metadata.name.clone();
        self.record("update", "rolebinding", &ns, &name);
        let mut bindings = self.role_bindings.lock();
        let slot = bindings
            .get_mut(&key(&ns, &name))
            .ok_or_else(|| ClusterError::NotFound(name.clone()))?;
        if slot.role_ref != binding.role_ref {
            return Err(ClusterError::Status {
                status: 422,
                message: "roleRef is immutable".into(),
            });
        }
        *slot = binding.clone();
        Ok(binding.clone())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.record("delete", "rolebinding", namespace, name);
        self.role_bindings
            .lock()
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn get_agentic_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AgenticSession, ClusterError> {
        self.sessions
            .lock()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn create_agentic_session(
        &self,
        session: &AgenticSession,
    ) -> Result<AgenticSession, ClusterError> {
        let ns = session.metadata.namespace().to_string();
        let name = session.metadata.name.clone();
        self.record("create", "agenticsession", &ns, &name);
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&key(&ns, &name)) {
            return Err(ClusterError::Conflict(name));
        }
        let mut stored = session.clone();
        stored.metadata.uid = Some(format!("uid-{name}"));
        sessions.insert(key(&ns, &name), stored.clone());
        Ok(stored)
    }

    async fn update_agentic_session(
        &self,
        session: &AgenticSession,
    ) -> Result<AgenticSession, ClusterError> {
        let ns = session.metadata.namespace().to_string();
        let name = session.metadata.name.clone();
        self.record("update", "agenticsession", &ns, &name);
        let mut sessions = self.sessions.lock();
        let slot = sessions
            .get_mut(&key(&ns, &name))
            .ok_or_else(|| ClusterError::NotFound(name.clone()))?;
        // Status is a subresource; a spec update leaves it alone.
        let status = slot.status.take();
        let uid = slot.metadata.uid.clone();
        *slot = session.clone();
        slot.status = status;
        slot.metadata.uid = uid;
        Ok(slot.clone())
    }

    async fn delete_agentic_session(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.record("delete", "agenticsession", namespace, name);
        self.sessions
            .lock()
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }
}
