//! Local runner supervision
//!
//! One OS process per session. Each runner owns a port from the pool, a
//! workspace directory and a pair of log files, and is started as the leader
//! of its own process group so stop/kill reach everything it forks. Exits are
//! reported on a bounded channel that the reap loop drains.

mod env;
mod output;
mod signal;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LocalConfig;
use crate::error::ProcessError;
use crate::paths;
use crate::ports::PortPool;

use output::{join_pump_with_timeout, pump_output, OutputStream};

pub use env::{filter_inherited, is_inheritable, runner_environment, RunnerContext};
pub use output::StderrTail;
pub use signal::{ProcessGroupSignaler, SubtreeSignaler};

/// Reported once per runner when its OS process has exited and its port has
/// been returned to the pool.
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    pub session_id: String,
    pub exit_code: i32,
    pub stderr_tail: Vec<String>,
    pub duration: Duration,
}

impl ProcessExitEvent {
    pub fn stderr_text(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

/// A live (or just-exited) runner.
#[derive(Debug)]
pub struct RunnerProcess {
    pub session_id: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub workspace: PathBuf,
    pub log_dir: PathBuf,
    pub started_at: Instant,
    exited: CancellationToken,
    exit_code: OnceLock<i32>,
}

impl RunnerProcess {
    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    /// Resolves once the OS process has exited and been reaped.
    pub async fn wait(&self) {
        self.exited.cancelled().await
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.log_dir.join("stdout.log")
    }

}

#[derive(Debug)]
struct Settings {
    program: String,
    args: Vec<String>,
    command_line: String,
    workspace_root: PathBuf,
    max_sessions: usize,
    boss_url: Option<String>,
    boss_space: Option<String>,
    stderr_tail_lines: usize,
    stop_timeout: Duration,
}

/// Spawns, tracks and stops runner processes.
#[derive(Clone)]
pub struct ProcessManager {
    processes: Arc<Mutex<HashMap<String, Arc<RunnerProcess>>>>,
    ports: Arc<PortPool>,
    settings: Arc<Settings>,
    signaler: Arc<dyn SubtreeSignaler>,
    exit_tx: mpsc::Sender<ProcessExitEvent>,
    exit_rx: Arc<parking_lot::Mutex<Option<mpsc::Receiver<ProcessExitEvent>>>>,
}

impl ProcessManager {
    pub fn new(config: &LocalConfig) -> Result<Self, ProcessError> {
        let argv = shell_words::split(&config.runner_command)
            .map_err(|e| ProcessError::InvalidCommand(e.to_string()))?;
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
        let (exit_tx, exit_rx) = mpsc::channel(config.exit_queue_capacity.max(1));

        Ok(Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            ports: Arc::new(PortPool::new(config.port_range_start, config.port_range_end)),
            settings: Arc::new(Settings {
                program: program.clone(),
                args: args.to_vec(),
                command_line: config.runner_command.clone(),
                workspace_root: config.workspace_root.clone(),
                max_sessions: config.max_sessions,
                boss_url: config.boss_url.clone(),
                boss_space: config.boss_space.clone(),
                stderr_tail_lines: config.stderr_tail_lines,
                stop_timeout: config.stop_timeout(),
            }),
            signaler: Arc::new(ProcessGroupSignaler),
            exit_tx,
            exit_rx: Arc::new(parking_lot::Mutex::new(Some(exit_rx))),
        })
    }

    pub fn with_signaler(mut self, signaler: Arc<dyn SubtreeSignaler>) -> Self {
        self.signaler = signaler;
        self
    }

    /// The exit-event stream. Only the first caller gets it.
    pub fn take_exit_events(&self) -> Option<mpsc::Receiver<ProcessExitEvent>> {
        self.exit_rx.lock().take()
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    pub fn workspace_root(&self) -> &Path {
        &self.settings.workspace_root
    }

    /// Start a runner for `session_id`, or return the one already running.
    pub async fn spawn(
        &self,
        session_id: &str,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<Arc<RunnerProcess>, ProcessError> {
        validate_session_id(session_id)?;

        // Held across the launch so concurrent spawns for one session and
        // the limit check cannot interleave.
        let mut processes = self.processes.lock().await;
        if let Some(existing) = processes.get(session_id) {
            tracing::debug!(session_id, pid = ?existing.pid, "Runner already running");
            return Ok(Arc::clone(existing));
        }
        if processes.len() >= self.settings.max_sessions {
            return Err(ProcessError::LimitReached {
                max: self.settings.max_sessions,
            });
        }

        let port = self.ports.allocate(session_id)?;
        match self.launch(session_id, port, extra_env).await {
            Ok(process) => {
                processes.insert(session_id.to_string(), Arc::clone(&process));
                Ok(process)
            }
            Err(e) => {
                self.ports.release(session_id);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        session_id: &str,
        port: u16,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<Arc<RunnerProcess>, ProcessError> {
        let settings = &self.settings;
        let workspace = paths::session_workspace(&settings.workspace_root, session_id);
        let log_dir = paths::session_logs(&settings.workspace_root, session_id);
        tokio::fs::create_dir_all(&workspace).await?;
        tokio::fs::create_dir_all(&log_dir).await?;
        let stdout_log = open_log(&log_dir.join("stdout.log")).await?;
        let stderr_log = open_log(&log_dir.join("stderr.log")).await?;

        let env = runner_environment(
            std::env::vars(),
            &RunnerContext {
                session_id,
                port,
                workspace: &workspace,
                boss_url: settings.boss_url.as_deref(),
                boss_space: settings.boss_space.as_deref(),
            },
            extra_env,
        );

        let mut cmd = Command::new(&settings.program);
        cmd.args(&settings.args)
            .current_dir(&workspace)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: settings.command_line.clone(),
            source,
        })?;
        let pid = child.id();

        let tail = Arc::new(parking_lot::Mutex::new(StderrTail::new(
            settings.stderr_tail_lines,
        )));
        let stdout_pump = child.stdout.take().map(|pipe| {
            tokio::spawn(pump_output(
                pipe,
                stdout_log,
                session_id.to_string(),
                OutputStream::Stdout,
                None,
            ))
        });
        let stderr_pump = child.stderr.take().map(|pipe| {
            tokio::spawn(pump_output(
                pipe,
                stderr_log,
                session_id.to_string(),
                OutputStream::Stderr,
                Some(Arc::clone(&tail)),
            ))
        });

        let process = Arc::new(RunnerProcess {
            session_id: session_id.to_string(),
            port,
            pid,
            workspace,
            log_dir,
            started_at: Instant::now(),
            exited: CancellationToken::new(),
            exit_code: OnceLock::new(),
        });

        tracing::info!(
            session_id,
            pid = ?pid,
            port,
            workspace = %process.workspace.display(),
            "Runner started"
        );

        tokio::spawn(self.clone().supervise(
            child,
            Arc::clone(&process),
            [stdout_pump, stderr_pump],
            tail,
        ));

        Ok(process)
    }

    async fn supervise(
        self,
        mut child: Child,
        process: Arc<RunnerProcess>,
        pumps: [Option<JoinHandle<()>>; 2],
        tail: Arc<parking_lot::Mutex<StderrTail>>,
    ) {
        let exit_code = match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                tracing::warn!(session_id = %process.session_id, error = %e, "Failed to wait on runner");
                -1
            }
        };
        for pump in pumps.into_iter().flatten() {
            join_pump_with_timeout(pump).await;
        }

        {
            let mut processes = self.processes.lock().await;
            let current = processes
                .get(&process.session_id)
                .is_some_and(|p| Arc::ptr_eq(p, &process));
            if current {
                processes.remove(&process.session_id);
                self.ports.release(&process.session_id);
            }
            let _ = process.exit_code.set(exit_code);
            process.exited.cancel();
        }

        let (stderr_tail, stderr_dropped) = {
            let tail = tail.lock();
            (tail.lines(), tail.dropped())
        };
        let event = ProcessExitEvent {
            session_id: process.session_id.clone(),
            exit_code,
            stderr_tail,
            duration: process.started_at.elapsed(),
        };
        tracing::info!(
            session_id = %event.session_id,
            exit_code,
            stderr_dropped,
            duration_ms = event.duration.as_millis() as u64,
            "Runner exited"
        );
        if self.exit_tx.send(event).await.is_err() {
            tracing::debug!(session_id = %process.session_id, "Exit receiver dropped");
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<RunnerProcess>> {
        self.processes.lock().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<RunnerProcess>> {
        self.processes.lock().await.values().cloned().collect()
    }

    pub async fn running_count(&self) -> usize {
        self.processes.lock().await.len()
    }

    /// SIGTERM the runner's process group, escalating to SIGKILL after the
    /// stop timeout. Returns once the runner has exited. Unknown sessions
    /// are a no-op.
    pub async fn stop(&self, session_id: &str) {
        let Some(process) = self.get(session_id).await else {
            return;
        };
        self.terminate(&process, self.settings.stop_timeout).await;
    }

    /// SIGKILL the runner's process group and wait for it to exit.
    pub async fn kill(&self, session_id: &str) {
        let Some(process) = self.get(session_id).await else {
            return;
        };
        self.force_kill(&process).await;
    }

    async fn terminate(&self, process: &RunnerProcess, grace: Duration) {
        if process.has_exited() {
            return;
        }
        if let Some(pid) = process.pid {
            if let Err(e) = self.signaler.terminate(pid) {
                tracing::debug!(session_id = %process.session_id, pid, error = %e, "SIGTERM failed");
            }
        }
        if tokio::time::timeout(grace, process.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(
            session_id = %process.session_id,
            grace_secs = grace.as_secs(),
            "Runner did not exit after SIGTERM, killing"
        );
        self.force_kill(process).await;
    }

    async fn force_kill(&self, process: &RunnerProcess) {
        if process.has_exited() {
            return;
        }
        if let Some(pid) = process.pid {
            if let Err(e) = self.signaler.kill(pid) {
                tracing::debug!(session_id = %process.session_id, pid, error = %e, "SIGKILL failed");
            }
        }
        process.wait().await;
    }

    /// Terminate every runner. Survivors are killed when all have not
    /// exited by the first of: the stop timeout, `deadline`, or `cancel`.
    pub async fn shutdown(&self, deadline: Option<tokio::time::Instant>, cancel: &CancellationToken) {
        let live = self.list().await;
        if live.is_empty() {
            return;
        }
        tracing::info!(count = live.len(), "Stopping all runners");

        for process in &live {
            if let Some(pid) = process.pid {
                if let Err(e) = self.signaler.terminate(pid) {
                    tracing::debug!(session_id = %process.session_id, pid, error = %e, "SIGTERM failed");
                }
            }
        }

        let all_exited = futures::future::join_all(live.iter().map(|p| p.wait()));
        let until_deadline = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = all_exited => {
                tracing::info!("All runners exited");
                return;
            }
            _ = tokio::time::sleep(self.settings.stop_timeout) => {}
            _ = until_deadline => {}
            _ = cancel.cancelled() => {}
        }

        for process in live.iter().filter(|p| !p.has_exited()) {
            tracing::warn!(session_id = %process.session_id, "Runner survived shutdown grace, killing");
            if let Some(pid) = process.pid {
                let _ = self.signaler.kill(pid);
            }
        }
    }
}

fn validate_session_id(session_id: &str) -> Result<(), ProcessError> {
    let bad = session_id.is_empty()
        || session_id == "."
        || session_id == ".."
        || session_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(ProcessError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Own exit code, or -1 when there is none (killed by a signal).
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
