//! Per-session AG-UI reverse proxy.
//!
//! `/sessions/{id}/{suffix}` is forwarded to the runner listening on the
//! session's allocated loopback port. Only the suffixes a runner serves are
//! routed; the event stream is passed through unbuffered.
//!
//! | suffix         | runner request                          |
//! |----------------|-----------------------------------------|
//! | `events`       | `GET /` with `Accept: text/event-stream` |
//! | `run`          | `POST /`                                |
//! | `interrupt`    | `POST /interrupt`                       |
//! | `health`       | `GET /health`                           |
//! | `mcp/status`   | `GET /mcp/status`                       |
//! | `repos/status` | `GET /repos/status`                     |

use axum::{
    body::{self, Body},
    extract::{Path, Request, State},
    http::{header, HeaderName, Method, Response, StatusCode, Uri},
    response::IntoResponse,
    routing::any,
    Router,
};

use crate::error::AppError;
use crate::ProxyState;

const MAX_PROXY_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024;

pub fn router() -> Router<ProxyState> {
    Router::new().route("/sessions/:id/*suffix", any(proxy_session))
}

/// Runner endpoints reachable through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunnerEndpoint {
    Events,
    Run,
    Interrupt,
    Health,
    McpStatus,
    ReposStatus,
}

impl RunnerEndpoint {
    fn parse(suffix: &str) -> Option<Self> {
        match suffix.trim_matches('/') {
            "events" => Some(Self::Events),
            "run" => Some(Self::Run),
            "interrupt" => Some(Self::Interrupt),
            "health" => Some(Self::Health),
            "mcp/status" => Some(Self::McpStatus),
            "repos/status" => Some(Self::ReposStatus),
            _ => None,
        }
    }

    fn upstream_path(self) -> &'static str {
        match self {
            Self::Events | Self::Run => "/",
            Self::Interrupt => "/interrupt",
            Self::Health => "/health",
            Self::McpStatus => "/mcp/status",
            Self::ReposStatus => "/repos/status",
        }
    }

    fn method(self) -> Method {
        match self {
            Self::Run | Self::Interrupt => Method::POST,
            _ => Method::GET,
        }
    }

    fn is_event_stream(self) -> bool {
        self == Self::Events
    }
}

async fn proxy_session(
    State(state): State<ProxyState>,
    Path((session_id, suffix)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    request: Request,
) -> Result<Response<Body>, AppError> {
    if method == Method::OPTIONS {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let endpoint = RunnerEndpoint::parse(&suffix)
        .ok_or_else(|| AppError::NotFound(format!("Unknown session endpoint: {}", suffix)))?;
    if method != endpoint.method() {
        return Err(AppError::BadRequest(format!(
            "{} expects {}, got {}",
            suffix,
            endpoint.method(),
            method
        )));
    }

    let process = state
        .processes
        .get(&session_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("No running session {}", session_id)))?;

    let upstream_url = format!(
        "{}{}",
        process.base_url(),
        build_upstream_path(endpoint.upstream_path(), uri.query())
    );
    tracing::debug!(session_id = %session_id, %upstream_url, "Proxying runner request");

    let client = if endpoint.is_event_stream() {
        &state.stream_client
    } else {
        &state.client
    };
    proxy_http_request(client, endpoint, method, upstream_url, request).await
}

async fn proxy_http_request(
    client: &reqwest::Client,
    endpoint: RunnerEndpoint,
    method: Method,
    upstream_url: String,
    request: Request,
) -> Result<Response<Body>, AppError> {
    let request_headers = request.headers().clone();
    let body_bytes = body::to_bytes(request.into_body(), MAX_PROXY_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| AppError::BadRequest(format!("Request body too large: {}", e)))?;

    let mut upstream = client.request(method, &upstream_url).body(body_bytes);
    for (name, value) in &request_headers {
        if should_forward_request_header(name)
            && !(endpoint.is_event_stream() && *name == header::ACCEPT)
        {
            upstream = upstream.header(name, value);
        }
    }
    if endpoint.is_event_stream() {
        upstream = upstream.header(header::ACCEPT, "text/event-stream");
    }
    if let Some(host) = request_headers.get(header::HOST) {
        upstream = upstream.header("x-forwarded-host", host.clone());
    }
    upstream = upstream
        .header("x-forwarded-proto", "http")
        .header("x-forwarded-for", "127.0.0.1");

    let upstream_response = upstream.send().await.map_err(|e| {
        AppError::BadGateway(format!("Failed to reach runner on {}: {}", upstream_url, e))
    })?;

    let status = upstream_response.status();
    let mut response_builder = Response::builder().status(status);

    if endpoint.is_event_stream() {
        for (name, value) in upstream_response.headers() {
            if should_forward_response_header(name) && !is_stream_overridden_header(name) {
                response_builder = response_builder.header(name, value);
            }
        }
        return response_builder
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(upstream_response.bytes_stream()))
            .map_err(|e| AppError::Internal(format!("Failed to build stream response: {}", e)));
    }

    let response_headers = upstream_response.headers().clone();
    let response_body = upstream_response.bytes().await.map_err(|e| {
        AppError::BadGateway(format!("Failed reading runner response body: {}", e))
    })?;
    for (name, value) in &response_headers {
        if should_forward_response_header(name) {
            response_builder = response_builder.header(name, value);
        }
    }

    response_builder
        .body(Body::from(response_body))
        .map_err(|e| AppError::Internal(format!("Failed to build proxy response: {}", e)))
}

fn build_upstream_path(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{}?{}", path, query),
        _ => path.to_string(),
    }
}

fn should_forward_request_header(name: &HeaderName) -> bool {
    !is_hop_by_hop_header(name) && *name != header::HOST
}

fn should_forward_response_header(name: &HeaderName) -> bool {
    !is_hop_by_hop_header(name)
}

/// Headers the event stream always sets itself.
fn is_stream_overridden_header(name: &HeaderName) -> bool {
    *name == header::CONTENT_TYPE || *name == header::CACHE_CONTROL || *name == header::CONTENT_LENGTH
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}
