//! Control-plane configuration
//!
//! Precedence, lowest first: built-in defaults, optional TOML file,
//! environment variables, command-line flags (applied by the binary).

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;

/// Which execution substrate the control plane drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Kubernetes custom resources.
    #[default]
    Cluster,
    /// Local OS subprocesses on a single node.
    Local,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cluster" | "kube" | "kubernetes" => Ok(ExecutionMode::Cluster),
            "local" => Ok(ExecutionMode::Local),
            other => Err(ConfigError::Invalid(format!(
                "unknown mode {other:?} (expected cluster or local)"
            ))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Cluster => "cluster",
            ExecutionMode::Local => "local",
        })
    }
}

/// How informer events are queued for reconcilers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One queue and one dispatch task: a single FIFO across all kinds.
    #[default]
    Global,
    /// One queue and dispatch task per kind; a slow kind cannot delay another.
    PerKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub mode: ExecutionMode,
    pub api: ApiConfig,
    pub informer: InformerConfig,
    pub watch: WatchConfig,
    pub kube: KubeConfig,
    pub local: LocalConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub page_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            token: None,
            page_size: 100,
            request_timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InformerConfig {
    pub queue_capacity: usize,
    pub dispatch: DispatchMode,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            dispatch: DispatchMode::Global,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
    /// Reset the reconnect counter after a stream stayed up this long. `None` never resets.
    pub reset_after_secs: Option<u64>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_secs: 30,
            reset_after_secs: None,
        }
    }
}

impl WatchConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn reset_after(&self) -> Option<Duration> {
        self.reset_after_secs.map(Duration::from_secs)
    }
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    /// API server URL; resolved from the in-cluster service env when absent.
    pub api_server: Option<String>,
    pub token: Option<String>,
    pub token_file: PathBuf,
    pub ca_file: PathBuf,
    pub insecure_skip_tls_verify: bool,
    pub default_namespace: String,
    pub request_timeout_secs: u64,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_server: None,
            token: None,
            token_file: Path::new(SERVICE_ACCOUNT_DIR).join("token"),
            ca_file: Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt"),
            insecure_skip_tls_verify: false,
            default_namespace: "ambient-code".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl KubeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub runner_command: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub max_sessions: usize,
    pub workspace_root: PathBuf,
    pub boss_url: Option<String>,
    pub boss_space: Option<String>,
    pub stderr_tail_lines: usize,
    pub stop_timeout_secs: u64,
    pub exit_queue_capacity: usize,
    pub health_interval_ms: u64,
    pub health_attempts: u32,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            runner_command: "python -m ambient_runner".to_string(),
            port_range_start: 9100,
            port_range_end: 9199,
            max_sessions: 10,
            workspace_root: paths::sessions_dir(),
            boss_url: None,
            boss_space: None,
            stderr_tail_lines: 50,
            stop_timeout_secs: 10,
            exit_queue_capacity: 64,
            health_interval_ms: 500,
            health_attempts: 30,
        }
    }
}

impl LocalConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: String,
    pub cors_origin: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".to_string(),
            cors_origin: "http://localhost:3000".to_string(),
        }
    }
}

impl ControlPlaneConfig {
    /// Defaults, then the file at `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: ControlPlaneConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        tracing::info!(path = %path.display(), "Loaded control-plane config");
        Ok(config)
    }

    /// Overlay environment variables using `lookup` (injectable for tests).
    /// Values that do not parse are an error, not a silent fallback.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(mode) = non_empty("AMBIENT_MODE") {
            self.mode = mode
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("AMBIENT_MODE: {e}")))?;
        }
        if let Some(url) = non_empty("AMBIENT_API_URL") {
            self.api.base_url = url;
        }
        if let Some(token) = non_empty("AMBIENT_API_TOKEN") {
            self.api.token = Some(token);
        }
        if let Some(ns) = non_empty("AMBIENT_NAMESPACE") {
            self.kube.default_namespace = ns;
        }
        if self.kube.api_server.is_none() {
            if let Some(host) = non_empty("KUBERNETES_SERVICE_HOST") {
                let port = non_empty("KUBERNETES_SERVICE_PORT").unwrap_or_else(|| "443".into());
                // IPv6 service hosts need brackets
                let host = if host.contains(':') {
                    format!("[{host}]")
                } else {
                    host
                };
                self.kube.api_server = Some(format!("https://{host}:{port}"));
            }
        }
        if let Some(command) = non_empty("AMBIENT_RUNNER_COMMAND") {
            self.local.runner_command = command;
        }
        if let Some(max) = non_empty("AMBIENT_MAX_SESSIONS") {
            self.local.max_sessions = max.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("AMBIENT_MAX_SESSIONS must be a number, got {max:?}"))
            })?;
        }
        if let Some(root) = non_empty("AMBIENT_WORKSPACE_ROOT") {
            self.local.workspace_root = PathBuf::from(root);
        }
        if let Some(url) = non_empty("BOSS_URL") {
            self.local.boss_url = Some(url);
        }
        if let Some(space) = non_empty("BOSS_SPACE") {
            self.local.boss_space = Some(space);
        }
        if let Some(addr) = non_empty("AMBIENT_PROXY_ADDR") {
            self.proxy.listen = addr;
        }
        if let Some(origin) = non_empty("AMBIENT_CORS_ORIGIN") {
            self.proxy.cors_origin = origin;
        }
        Ok(())
    }

    /// Reject configurations that cannot run. Called before anything starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.api.base_url)
            .map_err(|e| ConfigError::Invalid(format!("api.base_url: {e}")))?;
        if self.api.page_size == 0 {
            return Err(ConfigError::Invalid("api.page_size must be > 0".into()));
        }
        if self.informer.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "informer.queue_capacity must be > 0".into(),
            ));
        }
        if self.watch.base_backoff_ms == 0 || self.watch.max_backoff_secs == 0 {
            return Err(ConfigError::Invalid("watch backoff must be > 0".into()));
        }

        match self.mode {
            ExecutionMode::Cluster => {
                let Some(server) = self.kube.api_server.as_deref() else {
                    return Err(ConfigError::Invalid(
                        "cluster mode needs kube.api_server or KUBERNETES_SERVICE_HOST".into(),
                    ));
                };
                url::Url::parse(server)
                    .map_err(|e| ConfigError::Invalid(format!("kube.api_server: {e}")))?;
            }
            ExecutionMode::Local => {
                let local = &self.local;
                let argv = shell_words::split(&local.runner_command)
                    .map_err(|e| ConfigError::Invalid(format!("local.runner_command: {e}")))?;
                if argv.is_empty() {
                    return Err(ConfigError::Invalid(
                        "local.runner_command is empty".into(),
                    ));
                }
                if local.port_range_start == 0 || local.port_range_start > local.port_range_end {
                    return Err(ConfigError::Invalid(format!(
                        "invalid port range {}-{}",
                        local.port_range_start, local.port_range_end
                    )));
                }
                if local.max_sessions == 0 || local.exit_queue_capacity == 0 {
                    return Err(ConfigError::Invalid(
                        "local.max_sessions and local.exit_queue_capacity must be > 0".into(),
                    ));
                }
                self.proxy
                    .listen
                    .parse::<SocketAddr>()
                    .map_err(|e| ConfigError::Invalid(format!("proxy.listen: {e}")))?;
                if self.proxy.cors_origin.trim().is_empty() {
                    return Err(ConfigError::Invalid("proxy.cors_origin is empty".into()));
                }
            }
        }
        Ok(())
    }
}
