//! Watch manager
//!
//! Keeps one streaming watch open per registered resource kind. A failed or
//! ended stream is reopened after `min(base * 2^attempt, max)`; messages are
//! handed to every handler of the kind synchronously and in stream order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::error::ApiError;
use crate::resources::ResourceKind;

/// Event type as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum WireEventType {
    #[serde(rename = "CREATED", alias = "EVENT_TYPE_CREATED")]
    Created,
    #[serde(rename = "UPDATED", alias = "EVENT_TYPE_UPDATED")]
    Updated,
    #[serde(rename = "DELETED", alias = "EVENT_TYPE_DELETED")]
    Deleted,
}

/// One message of a watch stream. `object` is absent on deletes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireWatchEvent {
    #[serde(rename = "type")]
    pub event_type: WireEventType,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub object: Option<Value>,
}

/// A wire event tagged with the kind of the stream it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: WireEventType,
    pub resource: ResourceKind,
    pub resource_id: String,
    pub object: Option<Value>,
}

pub type WatchStream = BoxStream<'static, Result<WireWatchEvent, ApiError>>;

/// Opens server-streaming watches.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn open(&self, kind: ResourceKind) -> Result<WatchStream, ApiError>;
}

/// Receives watch events for one kind.
#[async_trait]
pub trait WatchHandler: Send + Sync {
    async fn handle(&self, event: WatchEvent) -> anyhow::Result<()>;
}

/// Reconnect delay before retry number `attempt` (0-based).
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

pub struct WatchManager {
    source: Arc<dyn WatchSource>,
    handlers: RwLock<HashMap<ResourceKind, Vec<Arc<dyn WatchHandler>>>>,
    config: WatchConfig,
}

enum StreamOutcome {
    Cancelled,
    Ended,
    Failed(ApiError),
}

impl WatchManager {
    pub fn new(source: Arc<dyn WatchSource>, config: WatchConfig) -> Self {
        Self {
            source,
            handlers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register a handler. Must happen before `run`.
    pub fn register_handler(&self, kind: ResourceKind, handler: Arc<dyn WatchHandler>) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Run one watch loop per registered kind until `cancel` fires.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let kinds: Vec<ResourceKind> = self.handlers.read().keys().copied().collect();
        if kinds.is_empty() {
            warn!("Watch manager started with no handlers");
        }

        let loops: Vec<_> = kinds
            .into_iter()
            .map(|kind| tokio::spawn(Arc::clone(self).watch_loop(kind, cancel.clone())))
            .collect();

        for handle in futures::future::join_all(loops).await {
            if let Err(e) = handle {
                error!("Watch loop task failed: {}", e);
            }
        }
    }

    async fn watch_loop(self: Arc<Self>, kind: ResourceKind, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            let opened_at = Instant::now();
            match self.stream_once(kind, &cancel).await {
                StreamOutcome::Cancelled => {
                    debug!(resource = %kind, "Watch loop stopped");
                    return;
                }
                StreamOutcome::Ended => {
                    warn!(resource = %kind, attempt, "Watch stream ended");
                }
                StreamOutcome::Failed(err) => {
                    warn!(resource = %kind, attempt, error = %err, "Watch stream failed");
                }
            }

            if let Some(reset_after) = self.config.reset_after() {
                if opened_at.elapsed() >= reset_after {
                    attempt = 0;
                }
            }

            let delay = backoff_delay(
                attempt,
                self.config.base_backoff(),
                self.config.max_backoff(),
            );
            info!(
                resource = %kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting watch"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn stream_once(&self, kind: ResourceKind, cancel: &CancellationToken) -> StreamOutcome {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            opened = self.source.open(kind) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return StreamOutcome::Failed(err),
        };
        info!(resource = %kind, "Watch stream opened");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(wire)) => self.dispatch(kind, wire).await,
                Some(Err(err)) => return StreamOutcome::Failed(err),
                None => return StreamOutcome::Ended,
            }
        }
    }

    async fn dispatch(&self, kind: ResourceKind, wire: WireWatchEvent) {
        let handlers = self.handlers.read().get(&kind).cloned().unwrap_or_default();
        let event = WatchEvent {
            event_type: wire.event_type,
            resource: kind,
            resource_id: wire.resource_id,
            object: wire.object,
        };
        for handler in handlers {
            if let Err(err) = handler.handle(event.clone()).await {
                error!(
                    resource = %kind,
                    resource_id = %event.resource_id,
                    error = %err,
                    "Watch handler failed"
                );
            }
        }
    }
}
