//! Informer
//!
//! Per-kind in-memory caches fed by a full paginated list sync and then by
//! the watch manager. Every cache mutation becomes a `ResourceEvent` pushed
//! onto a bounded dispatch queue, which a dispatch task drains into the
//! reconcilers registered for the event's kind.
//!
//! With `DispatchMode::Global` there is one queue for all kinds, so delivery
//! is a single FIFO and a slow reconciler for one kind delays the others.
//! `DispatchMode::PerKind` gives each kind its own queue and task instead.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::config::{DispatchMode, InformerConfig};
use crate::error::ValidationError;
use crate::reconciler::{ProjectLookup, Reconciler};
use crate::resources::{Project, ResourceEvent, ResourceKind, ResourceObject};
use crate::watch::{WatchEvent, WatchHandler, WatchManager, WireEventType};

type Cache = Mutex<HashMap<String, ResourceObject>>;
type Handlers = HashMap<ResourceKind, Vec<Arc<dyn Reconciler>>>;

pub struct Informer {
    api: Arc<dyn ApiClient>,
    watch: Arc<WatchManager>,
    page_size: u32,
    caches: HashMap<ResourceKind, Cache>,
    handlers: Arc<RwLock<Handlers>>,
    senders: HashMap<ResourceKind, mpsc::Sender<ResourceEvent>>,
    receivers: Mutex<Vec<mpsc::Receiver<ResourceEvent>>>,
}

impl Informer {
    pub fn new(
        api: Arc<dyn ApiClient>,
        watch: Arc<WatchManager>,
        page_size: u32,
        config: &InformerConfig,
    ) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        match config.dispatch {
            DispatchMode::Global => {
                let (tx, rx) = mpsc::channel(config.queue_capacity);
                for kind in ResourceKind::ALL {
                    senders.insert(kind, tx.clone());
                }
                receivers.push(rx);
            }
            DispatchMode::PerKind => {
                for kind in ResourceKind::ALL {
                    let (tx, rx) = mpsc::channel(config.queue_capacity);
                    senders.insert(kind, tx);
                    receivers.push(rx);
                }
            }
        }

        Self {
            api,
            watch,
            page_size,
            caches: ResourceKind::ALL
                .into_iter()
                .map(|kind| (kind, Mutex::new(HashMap::new())))
                .collect(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            senders,
            receivers: Mutex::new(receivers),
        }
    }

    /// Register a reconciler for the kind it reports. Must happen before `run`.
    pub fn register(&self, reconciler: Arc<dyn Reconciler>) {
        let kind = reconciler.resource();
        info!(resource = %kind, "Registered reconciler");
        self.handlers.write().entry(kind).or_default().push(reconciler);
    }

    /// Start dispatching, sync every kind, then follow the watch streams
    /// until `cancel` fires. An initial sync failure is returned (fatal).
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let receivers = std::mem::take(&mut *self.receivers.lock().await);
        if receivers.is_empty() {
            anyhow::bail!("informer is already running");
        }

        // Dispatch starts first: the sync can emit more events than the queue holds.
        let dispatchers: Vec<_> = receivers
            .into_iter()
            .map(|rx| {
                tokio::spawn(dispatch_loop(
                    rx,
                    Arc::clone(&self.handlers),
                    cancel.clone(),
                ))
            })
            .collect();

        for kind in ResourceKind::ALL {
            self.sync(kind, &cancel)
                .await
                .with_context(|| format!("initial sync of {kind} failed"))?;
        }

        for kind in ResourceKind::ALL {
            self.watch.register_handler(
                kind,
                Arc::new(CacheWatchAdapter {
                    informer: Arc::clone(self),
                    cancel: cancel.clone(),
                }),
            );
        }
        self.watch.run(cancel.clone()).await;

        for handle in futures::future::join_all(dispatchers).await {
            if let Err(e) = handle {
                error!("Dispatch task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Page through `kind`, populate its cache and emit an Added per item.
    async fn sync(&self, kind: ResourceKind, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let result = self.api.list(kind, page, self.page_size).await?;
            if result.items.is_empty() {
                break;
            }
            items.extend(result.items);
            if items.len() >= result.total {
                break;
            }
            page += 1;
        }
        info!(resource = %kind, count = items.len(), "Initial sync complete");

        {
            let mut cache = self.cache(kind).lock().await;
            cache.clear();
            for item in &items {
                cache.insert(item.id().to_string(), item.clone());
            }
        }

        for item in items {
            self.enqueue(ResourceEvent::added(item), cancel).await?;
        }
        Ok(())
    }

    /// Apply a watch event to the cache and describe the resulting mutation.
    /// Deletes of unknown ids produce no event.
    pub async fn apply_watch_event(
        &self,
        event: WatchEvent,
    ) -> Result<Option<ResourceEvent>, ValidationError> {
        let kind = event.resource;
        let mut cache = self.cache(kind).lock().await;
        match event.event_type {
            WireEventType::Created | WireEventType::Updated => {
                let Some(value) = event.object else {
                    warn!(
                        resource = %kind,
                        resource_id = %event.resource_id,
                        "Watch upsert without object, ignoring"
                    );
                    return Ok(None);
                };
                let object = ResourceObject::decode(kind, value).map_err(|source| {
                    ValidationError::MalformedJson {
                        field: "watch object",
                        source,
                    }
                })?;
                let old = cache.insert(object.id().to_string(), object.clone());
                Ok(Some(match event.event_type {
                    WireEventType::Created => ResourceEvent::added(object),
                    _ => ResourceEvent::modified(object, old),
                }))
            }
            WireEventType::Deleted => match cache.remove(&event.resource_id) {
                Some(removed) => Ok(Some(ResourceEvent::deleted(removed))),
                None => {
                    debug!(
                        resource = %kind,
                        resource_id = %event.resource_id,
                        "Delete for uncached object"
                    );
                    Ok(None)
                }
            },
        }
    }

    /// Push onto the dispatch queue, waiting while it is full.
    async fn enqueue(&self, event: ResourceEvent, cancel: &CancellationToken) -> anyhow::Result<()> {
        let kind = event.resource;
        let sender = self
            .senders
            .get(&kind)
            .context("no dispatch queue for resource kind")?;
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled while enqueueing {kind} event"),
            sent = sender.send(event) => sent.map_err(|_| anyhow::anyhow!("dispatch queue closed")),
        }
    }

    fn cache(&self, kind: ResourceKind) -> &Cache {
        &self.caches[&kind]
    }

    pub async fn get(&self, kind: ResourceKind, id: &str) -> Option<ResourceObject> {
        self.cache(kind).lock().await.get(id).cloned()
    }

    pub async fn len(&self, kind: ResourceKind) -> usize {
        self.cache(kind).lock().await.len()
    }
}

#[async_trait]
impl ProjectLookup for Informer {
    async fn project(&self, id: &str) -> Option<Project> {
        self.get(ResourceKind::Projects, id)
            .await
            .and_then(|o| o.as_project().cloned())
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<ResourceEvent>,
    handlers: Arc<RwLock<Handlers>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let targets = handlers
            .read()
            .get(&event.resource)
            .cloned()
            .unwrap_or_default();
        for reconciler in targets {
            if let Err(err) = reconciler.reconcile(&event).await {
                let permanent = err.downcast_ref::<ValidationError>().is_some();
                error!(
                    resource = %event.resource,
                    resource_id = %event.object.id(),
                    event = %event.event_type,
                    permanent,
                    error = %format!("{err:#}"),
                    "Reconcile failed"
                );
            }
        }
    }
}

/// Feeds one kind's watch stream into the informer cache and queue.
struct CacheWatchAdapter {
    informer: Arc<Informer>,
    cancel: CancellationToken,
}

#[async_trait]
impl WatchHandler for CacheWatchAdapter {
    async fn handle(&self, event: WatchEvent) -> anyhow::Result<()> {
        if let Some(resource_event) = self.informer.apply_watch_event(event).await? {
            self.informer.enqueue(resource_event, &self.cancel).await?;
        }
        Ok(())
    }
}
