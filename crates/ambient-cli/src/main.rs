//! ambient-control-plane
//!
//! Keeps Kubernetes resources (cluster mode) or local runner processes
//! (local mode) in step with the sessions, projects and project settings
//! declared in the Ambient API.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use ambient_core::{paths, ControlPlaneConfig, ExecutionMode};

mod run;

/// Ambient control plane
#[derive(Parser)]
#[command(name = "ambient-control-plane", version)]
#[command(about = "Reconcile Ambient API state onto Kubernetes or local runner processes", long_about = None)]
struct Cli {
    /// Execution mode; overrides the config file and AMBIENT_MODE
    #[arg(long)]
    mode: Option<ExecutionMode>,

    /// TOML config file (default: ~/.ambient/control-plane.toml when present)
    #[arg(short, long, env = "AMBIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Ambient API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Runner command for local mode
    #[arg(long)]
    runner_command: Option<String>,

    /// Proxy listen address for local mode
    #[arg(long)]
    proxy_addr: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Defaults, config file, environment, then flags.
    fn load_config(&self) -> Result<ControlPlaneConfig> {
        let path = self.config.clone().or_else(|| {
            let default = paths::default_config_file();
            default.exists().then_some(default)
        });
        let mut config = ControlPlaneConfig::load(path.as_deref())?;

        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(url) = &self.api_url {
            config.api.base_url = url.clone();
        }
        if let Some(command) = &self.runner_command {
            config.local.runner_command = command.clone();
        }
        if let Some(addr) = &self.proxy_addr {
            config.proxy.listen = addr.clone();
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.load_config()?;
    tracing::info!(
        mode = %config.mode,
        api = %config.api.base_url,
        "Starting ambient control plane"
    );

    match config.mode {
        ExecutionMode::Cluster => run::cluster(config).await,
        ExecutionMode::Local => run::local(config).await,
    }
}
