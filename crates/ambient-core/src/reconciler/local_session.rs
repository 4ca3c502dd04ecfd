//! Local-mode session reconciler
//!
//! Drives one runner process per session through the phase machine:
//!
//! | Event    | Phase            | Action                          |
//! |----------|------------------|---------------------------------|
//! | Added    | "" / Pending     | spawn if no live process        |
//! | Added    | terminal         | ignore                          |
//! | Modified | Stopping         | stop live process               |
//! | Modified | Pending          | spawn if no live process        |
//! | Deleted  | any              | kill live process, drop marker  |
//!
//! Status flows back through `write_session_status`, so our own writes are
//! recognised when they come back as Modified events.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{parse_env_vars, write_session_status, Reconciler, WriteBackMarkers};
use crate::api::{ApiClient, Condition, SessionStatusPatch};
use crate::config::LocalConfig;
use crate::error::ValidationError;
use crate::process::{ProcessExitEvent, ProcessManager, RunnerProcess};
use crate::resources::{ResourceEvent, ResourceEventType, ResourceKind, Session, SessionPhase};

/// Variables the process manager owns; session-supplied values are dropped.
const RESERVED_ENV: [&str; 3] = ["SESSION_ID", "AGUI_PORT", "WORKSPACE_PATH"];

#[derive(Debug, Clone)]
pub struct LocalSessionConfig {
    pub health_interval: Duration,
    pub health_attempts: u32,
    /// Per-probe request timeout.
    pub probe_timeout: Duration,
    /// How long the reaper keeps recording exits after cancellation.
    pub shutdown_drain: Duration,
    /// Quiet period after the last runner is gone before the reaper returns.
    pub drain_idle: Duration,
}

impl Default for LocalSessionConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_millis(500),
            health_attempts: 30,
            probe_timeout: Duration::from_secs(2),
            shutdown_drain: Duration::from_secs(15),
            drain_idle: Duration::from_millis(250),
        }
    }
}

impl From<&LocalConfig> for LocalSessionConfig {
    fn from(config: &LocalConfig) -> Self {
        Self {
            health_interval: config.health_interval(),
            health_attempts: config.health_attempts,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct LocalSessionReconciler {
    api: Arc<dyn ApiClient>,
    processes: ProcessManager,
    markers: Arc<WriteBackMarkers>,
    http: reqwest::Client,
    config: LocalSessionConfig,
    /// Sessions whose exit we caused (stop, kill, failed health check). The
    /// reaper leaves their status to whoever asked for the exit.
    solicited: Arc<Mutex<HashSet<String>>>,
    /// Serialises phase writes so a fast exit cannot be overwritten by a
    /// stale Creating or Running.
    transitions: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
}

impl LocalSessionReconciler {
    pub fn new(
        api: Arc<dyn ApiClient>,
        processes: ProcessManager,
        markers: Arc<WriteBackMarkers>,
        config: LocalSessionConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .context("failed to build health-check client")?;
        Ok(Self {
            api,
            processes,
            markers,
            http,
            config,
            solicited: Arc::new(Mutex::new(HashSet::new())),
            transitions: Arc::new(tokio::sync::Mutex::new(())),
            cancel,
        })
    }

    async fn write(&self, session_id: &str, patch: SessionStatusPatch) -> anyhow::Result<()> {
        write_session_status(&self.api, &self.markers, session_id, patch)
            .await
            .with_context(|| format!("failed to write status for session {session_id}"))
    }

    /// For background tasks: nobody is left to return the error to.
    async fn write_logged(&self, session_id: &str, patch: SessionStatusPatch) {
        if let Err(e) = self.write(session_id, patch).await {
            warn!(session_id, error = %format!("{e:#}"), "Status write failed");
        }
    }

    async fn has_live_process(&self, session_id: &str) -> bool {
        self.processes.get(session_id).await.is_some()
    }

    async fn spawn_session(&self, session: &Session) -> anyhow::Result<()> {
        let _transition = self.transitions.lock().await;
        let env = match runner_env(session) {
            Ok(env) => env,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Invalid session environment");
                return self
                    .write(&session.id, failed("InvalidEnvironment", e.to_string()))
                    .await;
            }
        };

        let process = match self.processes.spawn(&session.id, &env).await {
            Ok(process) => process,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Runner spawn failed");
                return self.write(&session.id, failed("SpawnFailed", e.to_string())).await;
            }
        };

        let creating = self
            .write(&session.id, SessionStatusPatch::phase(SessionPhase::Creating))
            .await;
        tokio::spawn(self.clone().await_healthy(process));
        creating
    }

    /// Poll the runner's `/health` until it answers 200, it exits, or the
    /// attempt budget runs out.
    async fn await_healthy(self, process: Arc<RunnerProcess>) {
        let session_id = process.session_id.clone();
        let url = format!("{}/health", process.base_url());

        for attempt in 1..=self.config.health_attempts {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = process.wait() => {
                    debug!(session_id = %session_id, "Runner exited before becoming healthy");
                    return;
                }
                _ = tokio::time::sleep(self.config.health_interval) => {}
            }

            match self.http.get(&url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    let _transition = self.transitions.lock().await;
                    if process.has_exited() {
                        return;
                    }
                    info!(session_id = %session_id, port = process.port, attempt, "Runner healthy");
                    let patch = SessionStatusPatch::phase(SessionPhase::Running)
                        .with_start_time(Utc::now());
                    self.write_logged(&session_id, patch).await;
                    return;
                }
                Ok(response) => {
                    debug!(session_id = %session_id, attempt, status = %response.status(), "Health probe not ready")
                }
                Err(e) => debug!(session_id = %session_id, attempt, error = %e, "Health probe failed"),
            }
        }

        let transition = self.transitions.lock().await;
        if process.has_exited() {
            return;
        }
        self.solicited.lock().insert(session_id.clone());
        warn!(
            session_id = %session_id,
            attempts = self.config.health_attempts,
            "Runner never became healthy, killing"
        );
        let message = format!(
            "runner did not answer /health after {} attempts",
            self.config.health_attempts
        );
        self.write_logged(&session_id, failed("HealthCheckFailed", message))
            .await;
        drop(transition);
        self.processes.kill(&session_id).await;
    }

    async fn stop_session(&self, session: &Session) -> anyhow::Result<()> {
        let transition = self.transitions.lock().await;
        if !self.has_live_process(&session.id).await {
            let patch =
                SessionStatusPatch::phase(SessionPhase::Stopped).with_completion_time(Utc::now());
            return self.write(&session.id, patch).await;
        }
        if !self.solicited.lock().insert(session.id.clone()) {
            debug!(session_id = %session.id, "Stop already in progress");
            return Ok(());
        }

        let stopping = self
            .write(&session.id, SessionStatusPatch::phase(SessionPhase::Stopping))
            .await;
        drop(transition);
        let this = self.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            this.processes.stop(&session_id).await;
            info!(session_id = %session_id, "Runner stopped");
            let patch =
                SessionStatusPatch::phase(SessionPhase::Stopped).with_completion_time(Utc::now());
            let _transition = this.transitions.lock().await;
            this.write_logged(&session_id, patch).await;
        });
        stopping
    }

    async fn delete_session(&self, session: &Session) {
        let transition = self.transitions.lock().await;
        let live = self.has_live_process(&session.id).await;
        if live {
            self.solicited.lock().insert(session.id.clone());
        }
        drop(transition);
        if live {
            self.processes.kill(&session.id).await;
            info!(session_id = %session.id, "Killed runner of deleted session");
        }
        self.markers.forget(&session.id);
    }

    /// Drain runner exit events, turning exits nobody asked for into
    /// Completed (code 0) or Failed. After cancellation the runners are being
    /// shut down; their exits are recorded as Stopped until none are left or
    /// `shutdown_drain` runs out.
    pub async fn run_reaper(self, mut exits: mpsc::Receiver<ProcessExitEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = exits.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            self.reap(event).await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_drain;
        loop {
            let idle = self.processes.running_count().await == 0;
            let wait_until = if idle {
                deadline.min(tokio::time::Instant::now() + self.config.drain_idle)
            } else {
                deadline
            };
            match tokio::time::timeout_at(wait_until, exits.recv()).await {
                Ok(Some(event)) => self.reap_on_shutdown(event).await,
                Ok(None) => return,
                Err(_) if idle || tokio::time::Instant::now() >= deadline => break,
                Err(_) => {}
            }
        }
        debug!("Reaper drained");
    }

    async fn reap_on_shutdown(&self, event: ProcessExitEvent) {
        let _transition = self.transitions.lock().await;
        if self.solicited.lock().remove(&event.session_id) {
            return;
        }
        info!(
            session_id = %event.session_id,
            exit_code = event.exit_code,
            "Runner stopped by control plane shutdown"
        );
        let patch = SessionStatusPatch::phase(SessionPhase::Stopped)
            .with_completion_time(Utc::now())
            .with_conditions(&[Condition::new(
                "Ready",
                false,
                "ControlPlaneShutdown",
                format!("runner stopped at shutdown with code {}", event.exit_code),
            )]);
        self.write_logged(&event.session_id, patch).await;
    }

    async fn reap(&self, event: ProcessExitEvent) {
        let _transition = self.transitions.lock().await;
        if self.solicited.lock().remove(&event.session_id) {
            debug!(session_id = %event.session_id, exit_code = event.exit_code, "Expected runner exit");
            return;
        }

        let patch = if event.exit_code == 0 {
            SessionStatusPatch::phase(SessionPhase::Completed)
                .with_completion_time(Utc::now())
                .with_conditions(&[Condition::new(
                    "Ready",
                    false,
                    "RunnerCompleted",
                    "runner exited with code 0",
                )])
        } else {
            let mut message = format!("runner exited with code {}", event.exit_code);
            let tail = event.stderr_text();
            if !tail.is_empty() {
                message.push_str(": ");
                message.push_str(&tail);
            }
            failed("RunnerFailed", message)
        };
        info!(
            session_id = %event.session_id,
            exit_code = event.exit_code,
            duration_ms = event.duration.as_millis() as u64,
            phase = ?patch.phase,
            "Runner exited on its own"
        );
        self.write_logged(&event.session_id, patch).await;
    }
}

#[async_trait]
impl Reconciler for LocalSessionReconciler {
    fn resource(&self) -> ResourceKind {
        ResourceKind::Sessions
    }

    async fn reconcile(&self, event: &ResourceEvent) -> anyhow::Result<()> {
        let session = event
            .object
            .as_session()
            .context("local session reconciler received a non-session object")?;
        if session.is_cluster_managed() {
            debug!(session_id = %session.id, "Session belongs to the cluster path");
            return Ok(());
        }

        if event.event_type == ResourceEventType::Deleted {
            self.delete_session(session).await;
            return Ok(());
        }

        if event.event_type == ResourceEventType::Modified
            && self
                .markers
                .is_echo(&session.id, session.updated_at.as_deref())
        {
            debug!(session_id = %session.id, "Ignoring echo of our own status write");
            return Ok(());
        }

        let Some(phase) = session.phase() else {
            warn!(session_id = %session.id, phase = ?session.phase, "Unknown session phase");
            return Ok(());
        };

        match phase {
            p if p.is_startable() => {
                // Unset only starts a runner on Added; Pending also restarts.
                let start = event.event_type == ResourceEventType::Added
                    || p == SessionPhase::Pending;
                if start && !self.has_live_process(&session.id).await {
                    self.spawn_session(session).await?;
                }
            }
            SessionPhase::Stopping => {
                if was_terminal(event) && !self.has_live_process(&session.id).await {
                    debug!(session_id = %session.id, "Stale Stopping after the runner stopped");
                    return Ok(());
                }
                self.stop_session(session).await?
            }
            p if p.is_terminal() => {
                debug!(session_id = %session.id, phase = %p, "Terminal phase, nothing to do")
            }
            _ => debug!(session_id = %session.id, phase = %phase, "No action for phase"),
        }
        Ok(())
    }
}

/// Whether the cached copy before this event had already finished.
fn was_terminal(event: &ResourceEvent) -> bool {
    event
        .old_object
        .as_ref()
        .and_then(|o| o.as_session())
        .and_then(Session::phase)
        .is_some_and(|p| p.is_terminal())
}

fn failed(reason: &str, message: String) -> SessionStatusPatch {
    SessionStatusPatch::phase(SessionPhase::Failed)
        .with_completion_time(Utc::now())
        .with_conditions(&[Condition::new("Ready", false, reason, message)])
}

/// Session-derived runner variables on top of the session's own
/// `environment_variables`.
fn runner_env(session: &Session) -> Result<BTreeMap<String, String>, ValidationError> {
    let mut env = parse_env_vars(session.environment_variables.as_deref())?;
    for reserved in RESERVED_ENV {
        env.remove(reserved);
    }

    let mut set = |key: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            env.insert(key.to_string(), value);
        }
    };
    set("INITIAL_PROMPT", session.prompt.clone());
    set("LLM_MODEL", session.llm_model.clone());
    set("LLM_TEMPERATURE", session.llm_temperature.map(|t| t.to_string()));
    set("LLM_MAX_TOKENS", session.llm_max_tokens.map(|t| t.to_string()));
    set("INTERACTIVE", session.interactive.map(|i| i.to_string()));
    set("REPOS_JSON", session.repos.clone());
    set("PROJECT_ID", session.project_id.clone());
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::session;

    #[test]
    fn runner_env_layers_session_fields_over_custom_vars() {
        let s = Session {
            prompt: Some("hello".into()),
            llm_temperature: Some(0.5),
            interactive: Some(true),
            project_id: Some("p1".into()),
            environment_variables: Some(
                r#"{"FOO": "bar", "SESSION_ID": "spoofed", "PROJECT_ID": "custom"}"#.into(),
            ),
            ..session("s1", "Pending")
        };
        let env = runner_env(&s).unwrap();
        assert_eq!(env["FOO"], "bar");
        assert_eq!(env["INITIAL_PROMPT"], "hello");
        assert_eq!(env["LLM_TEMPERATURE"], "0.5");
        assert_eq!(env["INTERACTIVE"], "true");
        assert_eq!(env["PROJECT_ID"], "p1");
        assert!(!env.contains_key("SESSION_ID"));
        assert!(!env.contains_key("LLM_MODEL"));
    }

    #[test]
    fn failure_patch_carries_reason_and_completion() {
        let patch = failed("SpawnFailed", "boom".into());
        assert_eq!(patch.phase.as_deref(), Some("Failed"));
        assert!(patch.completion_time.is_some());
        let conditions: Vec<Condition> =
            serde_json::from_str(patch.conditions.as_deref().unwrap()).unwrap();
        assert_eq!(conditions[0].reason, "SpawnFailed");
        assert_eq!(conditions[0].status, "False");
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::resources::ResourceObject;
        use crate::testing::{session, FakeApiClient};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        struct Harness {
            api: Arc<FakeApiClient>,
            processes: ProcessManager,
            markers: Arc<WriteBackMarkers>,
            reconciler: LocalSessionReconciler,
            cancel: CancellationToken,
            _dir: tempfile::TempDir,
        }

        impl Drop for Harness {
            fn drop(&mut self) {
                self.cancel.cancel();
            }
        }

        fn harness(command: &str, port_base: u16, health: LocalSessionConfig) -> Harness {
            let dir = tempfile::tempdir().unwrap();
            let local = LocalConfig {
                runner_command: command.to_string(),
                port_range_start: port_base,
                port_range_end: port_base + 4,
                workspace_root: dir.path().to_path_buf(),
                stop_timeout_secs: 2,
                ..LocalConfig::default()
            };
            let processes = ProcessManager::new(&local).unwrap();
            let api = Arc::new(FakeApiClient::default());
            let markers = Arc::new(WriteBackMarkers::new());
            let cancel = CancellationToken::new();
            let reconciler = LocalSessionReconciler::new(
                api.clone(),
                processes.clone(),
                markers.clone(),
                health,
                cancel.clone(),
            )
            .unwrap();
            Harness {
                api,
                processes,
                markers,
                reconciler,
                cancel,
                _dir: dir,
            }
        }

        fn quick_health(attempts: u32) -> LocalSessionConfig {
            LocalSessionConfig {
                health_interval: Duration::from_millis(20),
                health_attempts: attempts,
                probe_timeout: Duration::from_millis(200),
                shutdown_drain: Duration::from_secs(5),
                drain_idle: Duration::from_millis(100),
            }
        }

        fn added(s: Session) -> ResourceEvent {
            ResourceEvent::added(ResourceObject::Session(s))
        }

        fn modified(s: Session) -> ResourceEvent {
            ResourceEvent::modified(ResourceObject::Session(s), None)
        }

        async fn wait_for_phase(api: &FakeApiClient, id: &str, phase: &str) -> Vec<String> {
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let phases = api.phases_for(id);
                    if phases.iter().any(|p| p == phase) {
                        return phases;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("session {id} never reached {phase}: {:?}", api.phases_for(id)))
        }

        /// Answers every request with 200 until dropped.
        async fn serve_health(port: u16) -> tokio::task::JoinHandle<()> {
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                        .await;
                }
            })
        }

        #[tokio::test]
        async fn pending_session_spawns_and_turns_running() {
            let h = harness("sleep 30", 38_700, quick_health(200));
            h.reconciler.reconcile(&added(session("s1", "Pending"))).await.unwrap();

            let process = h.processes.get("s1").await.expect("runner spawned");
            assert_eq!(h.api.phases_for("s1"), vec!["Creating"]);
            assert!((38_700..=38_704).contains(&process.port));

            // Replayed Added does not spawn twice.
            h.reconciler.reconcile(&added(session("s1", "Pending"))).await.unwrap();
            assert_eq!(h.processes.running_count().await, 1);

            let server = serve_health(process.port).await;
            let phases = wait_for_phase(&h.api, "s1", "Running").await;
            assert_eq!(phases, vec!["Creating", "Running"]);
            let running = h.api.patches_for("s1").pop().unwrap();
            assert!(running.start_time.is_some());

            server.abort();
            h.processes.kill("s1").await;
        }

        #[tokio::test]
        async fn unhealthy_runner_is_failed_and_killed() {
            let h = harness("sleep 30", 38_710, quick_health(3));
            h.reconciler.reconcile(&added(session("s1", ""))).await.unwrap();

            let phases = wait_for_phase(&h.api, "s1", "Failed").await;
            assert_eq!(phases, vec!["Creating", "Failed"]);
            tokio::time::timeout(Duration::from_secs(5), async {
                while h.processes.get("s1").await.is_some() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("runner killed");
        }

        #[tokio::test]
        async fn terminal_and_cluster_sessions_are_ignored() {
            let h = harness("sleep 30", 38_720, quick_health(3));
            h.reconciler.reconcile(&added(session("done", "Completed"))).await.unwrap();
            let cluster_owned = Session {
                kube_cr_name: Some("cr-1".into()),
                ..session("k1", "Pending")
            };
            h.reconciler.reconcile(&added(cluster_owned)).await.unwrap();

            assert_eq!(h.processes.running_count().await, 0);
            assert!(h.api.patches().is_empty());
        }

        #[tokio::test]
        async fn stopping_without_runner_is_stopped_at_once() {
            let h = harness("sleep 30", 38_730, quick_health(3));
            h.reconciler.reconcile(&modified(session("s1", "Stopping"))).await.unwrap();

            let patches = h.api.patches_for("s1");
            assert_eq!(patches.len(), 1);
            assert_eq!(patches[0].phase.as_deref(), Some("Stopped"));
            assert!(patches[0].completion_time.is_some());
        }

        #[tokio::test]
        async fn stopping_stops_runner_then_reports_stopped() {
            let h = harness("sleep 30", 38_740, quick_health(1_000));
            let exits = h.processes.take_exit_events().unwrap();
            tokio::spawn(h.reconciler.clone().run_reaper(exits));

            h.reconciler.reconcile(&added(session("s1", "Pending"))).await.unwrap();
            let stop = Session {
                updated_at: Some("2030-01-01T00:00:00Z".into()),
                ..session("s1", "Stopping")
            };
            h.reconciler.reconcile(&modified(stop)).await.unwrap();

            let phases = wait_for_phase(&h.api, "s1", "Stopped").await;
            assert_eq!(phases, vec!["Creating", "Stopping", "Stopped"]);
            assert!(h.processes.get("s1").await.is_none());

            // The reaper saw a solicited exit and wrote nothing more.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(h.api.phases_for("s1").len(), 3);
        }

        #[tokio::test]
        async fn echo_of_stopping_write_does_not_restop() {
            let h = harness("sleep 30", 38_750, quick_health(1_000));
            h.reconciler.reconcile(&added(session("s1", "Pending"))).await.unwrap();

            let echo = Session {
                updated_at: h.markers.get("s1"),
                ..session("s1", "Stopping")
            };
            h.reconciler.reconcile(&modified(echo)).await.unwrap();
            assert_eq!(h.api.phases_for("s1"), vec!["Creating"]);
            assert!(h.processes.get("s1").await.is_some());

            h.processes.kill("s1").await;
        }

        #[tokio::test]
        async fn stale_stopping_after_stop_writes_nothing() {
            let h = harness("sleep 30", 38_790, quick_health(3));
            let stale = ResourceEvent::modified(
                ResourceObject::Session(Session {
                    updated_at: Some("2030-01-01T00:00:00Z".into()),
                    ..session("s1", "Stopping")
                }),
                Some(ResourceObject::Session(session("s1", "Stopped"))),
            );
            h.reconciler.reconcile(&stale).await.unwrap();
            assert!(h.api.patches().is_empty());

            // A Stopping that follows a live phase is still honoured.
            let fresh = ResourceEvent::modified(
                ResourceObject::Session(session("s1", "Stopping")),
                Some(ResourceObject::Session(session("s1", "Running"))),
            );
            h.reconciler.reconcile(&fresh).await.unwrap();
            assert_eq!(h.api.phases_for("s1"), vec!["Stopped"]);
        }

        #[tokio::test]
        async fn shutdown_exits_are_recorded_as_stopped() {
            let h = harness("sleep 30", 38_795, quick_health(1_000));
            let exits = h.processes.take_exit_events().unwrap();
            let reaper = tokio::spawn(h.reconciler.clone().run_reaper(exits));

            h.reconciler.reconcile(&added(session("s1", "Pending"))).await.unwrap();
            h.cancel.cancel();
            tokio::time::timeout(
                Duration::from_secs(10),
                h.processes.shutdown(None, &CancellationToken::new()),
            )
            .await
            .expect("shutdown completes");
            tokio::time::timeout(Duration::from_secs(10), reaper)
                .await
                .expect("reaper returns once runners are gone")
                .unwrap();

            assert_eq!(h.api.phases_for("s1"), vec!["Creating", "Stopped"]);
            let stopped = h.api.patches_for("s1").pop().unwrap();
            assert!(stopped.completion_time.is_some());
            let conditions: Vec<Condition> =
                serde_json::from_str(stopped.conditions.as_deref().unwrap()).unwrap();
            assert_eq!(conditions[0].reason, "ControlPlaneShutdown");
        }

        #[tokio::test]
        async fn unsolicited_exits_become_completed_or_failed() {
            let h = harness(
                "sh -c 'if [ \"$SESSION_ID\" = ok ]; then exit 0; fi; echo kaboom >&2; exit 2'",
                38_760,
                quick_health(1_000),
            );
            let exits = h.processes.take_exit_events().unwrap();
            tokio::spawn(h.reconciler.clone().run_reaper(exits));

            h.reconciler.reconcile(&added(session("ok", "Pending"))).await.unwrap();
            h.reconciler.reconcile(&added(session("bad", "Pending"))).await.unwrap();

            assert_eq!(wait_for_phase(&h.api, "ok", "Completed").await, vec!["Creating", "Completed"]);
            assert_eq!(wait_for_phase(&h.api, "bad", "Failed").await, vec!["Creating", "Failed"]);

            let failed = h.api.patches_for("bad").pop().unwrap();
            let conditions: Vec<Condition> =
                serde_json::from_str(failed.conditions.as_deref().unwrap()).unwrap();
            assert_eq!(conditions[0].reason, "RunnerFailed");
            assert!(conditions[0].message.contains("code 2"));
            assert!(conditions[0].message.contains("kaboom"));
        }

        #[tokio::test]
        async fn spawn_failure_marks_session_failed() {
            let h = harness("/nonexistent/ambient-runner", 38_770, quick_health(3));
            h.reconciler.reconcile(&added(session("s1", "Pending"))).await.unwrap();
            assert_eq!(h.api.phases_for("s1"), vec!["Failed"]);
            assert_eq!(h.processes.ports().allocated(), 0);
        }

        #[tokio::test]
        async fn delete_kills_runner_and_forgets_marker() {
            let h = harness("sleep 30", 38_780, quick_health(1_000));
            h.reconciler.reconcile(&added(session("s1", "Pending"))).await.unwrap();
            assert!(h.markers.get("s1").is_some());

            h.reconciler
                .reconcile(&ResourceEvent::deleted(ResourceObject::Session(session(
                    "s1", "Creating",
                ))))
                .await
                .unwrap();
            assert!(h.processes.get("s1").await.is_none());
            assert!(h.markers.get("s1").is_none());
            assert!(h.processes.workspace_root().join("s1").exists());
        }
    }
}
