//! Component wiring for each execution mode.
//!
//! Everything is built here and handed its dependencies explicitly; the
//! first SIGINT/SIGTERM cancels the root token, a second one skips the
//! grace period for runner processes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ambient_core::api::HttpApiClient;
use ambient_core::cluster::{ClusterClient, KubeRestClient};
use ambient_core::reconciler::{
    LocalSessionConfig, LocalSessionReconciler, ProjectLookup, ProjectReconciler,
    ProjectSettingsReconciler, SessionReconciler, WriteBackMarkers,
};
use ambient_core::{ControlPlaneConfig, Informer, ProcessManager, WatchManager};

/// Upper bound on stopping every runner after the root token fires.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

fn build_informer(config: &ControlPlaneConfig, api: &Arc<HttpApiClient>) -> Arc<Informer> {
    let watch = Arc::new(WatchManager::new(api.clone(), config.watch.clone()));
    Arc::new(Informer::new(
        api.clone(),
        watch,
        config.api.page_size,
        &config.informer,
    ))
}

/// Cluster mode: sessions become AgenticSession CRs, projects namespaces,
/// project settings RoleBindings.
pub async fn cluster(config: ControlPlaneConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone(), CancellationToken::new());

    let api = Arc::new(HttpApiClient::new(&config.api).context("failed to build API client")?);
    let cluster: Arc<dyn ClusterClient> = Arc::new(
        KubeRestClient::from_config(&config.kube).context("failed to build Kubernetes client")?,
    );
    let informer = build_informer(&config, &api);
    let projects: Arc<dyn ProjectLookup> = informer.clone();
    let markers = Arc::new(WriteBackMarkers::new());

    informer.register(Arc::new(SessionReconciler::new(
        api.clone(),
        cluster.clone(),
        projects.clone(),
        markers,
        config.kube.default_namespace.clone(),
    )));
    informer.register(Arc::new(ProjectReconciler::new(cluster.clone())));
    informer.register(Arc::new(ProjectSettingsReconciler::new(cluster, projects)));

    informer.run(cancel).await?;
    info!("Control plane stopped");
    Ok(())
}

/// Local mode: one runner process per session behind the AG-UI proxy.
pub async fn local(config: ControlPlaneConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let force = CancellationToken::new();
    spawn_signal_handler(cancel.clone(), force.clone());

    let api = Arc::new(HttpApiClient::new(&config.api).context("failed to build API client")?);
    let processes = ProcessManager::new(&config.local).context("invalid runner configuration")?;
    let exits = processes
        .take_exit_events()
        .context("runner exit events already claimed")?;
    let informer = build_informer(&config, &api);

    let reconciler = LocalSessionReconciler::new(
        api.clone(),
        processes.clone(),
        Arc::new(WriteBackMarkers::new()),
        LocalSessionConfig::from(&config.local),
        cancel.child_token(),
    )?;
    informer.register(Arc::new(reconciler.clone()));
    let reaper = tokio::spawn(reconciler.run_reaper(exits));

    let proxy = tokio::spawn({
        let proxy_config = config.proxy.clone();
        let processes = processes.clone();
        let cancel = cancel.clone();
        async move {
            let result =
                ambient_server::start_proxy(&proxy_config, processes, cancel.child_token()).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        }
    });

    let result = informer.run(cancel.clone()).await;
    cancel.cancel();

    info!(
        running = processes.running_count().await,
        "Stopping runner processes"
    );
    processes
        .shutdown(Some(tokio::time::Instant::now() + SHUTDOWN_DEADLINE), &force)
        .await;

    if let Err(e) = reaper.await {
        warn!("Reaper task failed: {}", e);
    }
    let proxy_result = proxy.await.context("proxy task panicked")?;
    info!("Control plane stopped");
    result.and(proxy_result)
}

fn spawn_signal_handler(cancel: CancellationToken, force: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        cancel.cancel();

        wait_for_signal().await;
        warn!("Second shutdown signal, killing remaining runners");
        force.cancel();
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl+c: {}", e);
        std::future::pending::<()>().await;
    }
}
