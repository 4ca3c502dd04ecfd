//! Ambient proxy server
//!
//! Local-mode HTTP front door: one reverse-proxy route family per running
//! session, plus a liveness endpoint. Started via `start_proxy()`.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderValue, Method, Uri},
    routing::get,
    Json, Router,
};
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use ambient_core::config::ProxyConfig;
use ambient_core::ProcessManager;

pub mod error;
pub mod proxy;

use error::AppError;

/// Non-streaming runner calls must answer within this.
const PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROXY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared proxy state.
#[derive(Clone)]
pub struct ProxyState {
    pub processes: ProcessManager,
    client: reqwest::Client,
    /// No overall timeout: event streams stay open for the life of a run.
    stream_client: reqwest::Client,
}

impl ProxyState {
    pub fn new(processes: ProcessManager) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(PROXY_CONNECT_TIMEOUT)
            .timeout(PROXY_REQUEST_TIMEOUT)
            .build()
            .context("failed to build proxy client")?;
        let stream_client = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(PROXY_CONNECT_TIMEOUT)
            .build()
            .context("failed to build stream proxy client")?;
        Ok(Self {
            processes,
            client,
            stream_client,
        })
    }
}

/// Build the router with CORS limited to `cors_origin`.
pub fn build_router(processes: ProcessManager, cors_origin: &str) -> anyhow::Result<Router> {
    let origin = HeaderValue::from_str(cors_origin)
        .with_context(|| format!("invalid CORS origin {:?}", cors_origin))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let state = ProxyState::new(processes)?;
    Ok(Router::new()
        .route("/health", get(health))
        .merge(proxy::router())
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Serve the proxy until `cancel` fires.
pub async fn start_proxy(
    config: &ProxyConfig,
    processes: ProcessManager,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid proxy listen address {:?}", config.listen))?;
    let app = build_router(processes, &config.cors_origin)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind proxy on {}", addr))?;
    tracing::info!("AG-UI proxy listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    tracing::info!("AG-UI proxy stopped");
    Ok(())
}

async fn health(State(state): State<ProxyState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.processes.running_count().await,
    })
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
    sessions: usize,
}
