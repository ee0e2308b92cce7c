//! Dynamic watch registry: one informer per kind, started at most once.
//!
//! Starting a watch and shutting down take the same lock, and the `stopping`
//! flag is checked under it before anything is spawned, so no watch can
//! slip in after `shutdown` returns.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tether_core::ObjectKind;
use tether_store::{Delta, Store, StoreError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{run_watcher, Resolver};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch registry is shutting down")]
    Stopping,
    #[error("starting watch for {kind}: {message}")]
    Source { kind: ObjectKind, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Produces the delta stream for a kind.
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Spawns the watch loop. It must stop when `cancel` fires.
    async fn start(&self, kind: &ObjectKind, tx: mpsc::Sender<Delta>, cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>>;
}

/// List+watch against the API server.
pub struct KubeWatchSource {
    resolver: Arc<Resolver>,
    namespace: Option<String>,
}

impl KubeWatchSource {
    pub fn new(resolver: Arc<Resolver>, namespace: Option<String>) -> Self {
        Self { resolver, namespace }
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    async fn start(&self, kind: &ObjectKind, tx: mpsc::Sender<Delta>, cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let api = self.resolver.api(kind, self.namespace.as_deref()).await?;
        Ok(tokio::spawn(run_watcher(kind.clone(), api, tx, cancel)))
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    stopping: bool,
    watches: FxHashMap<String, (ObjectKind, Running)>,
}

pub struct WatchRegistry {
    store: Store,
    source: Arc<dyn WatchSource>,
    channel_cap: usize,
    inner: Mutex<Inner>,
}

impl WatchRegistry {
    pub fn new(store: Store, source: Arc<dyn WatchSource>, channel_cap: usize) -> Self {
        Self { store, source, channel_cap: channel_cap.max(1), inner: Mutex::new(Inner::default()) }
    }

    /// Starts the watch for `kind` unless it runs already. Returns whether it was started now.
    pub async fn ensure_watch(&self, kind: &ObjectKind) -> Result<bool, WatchError> {
        let mut inner = self.inner.lock().await;
        if inner.stopping {
            return Err(WatchError::Stopping);
        }
        if inner.watches.contains_key(&kind.key()) {
            return Ok(false);
        }
        let (tx, rx) = mpsc::channel(self.channel_cap);
        self.store.add_informer(kind.clone(), rx).await?;
        let cancel = CancellationToken::new();
        let task = match self.source.start(kind, tx, cancel.clone()).await {
            Ok(task) => task,
            Err(e) => {
                if let Err(e) = self.store.remove_informer(kind).await {
                    warn!(kind = %kind, error = %e, "removing informer after failed start");
                }
                return Err(WatchError::Source { kind: kind.clone(), message: format!("{:#}", e) });
            }
        };
        inner.watches.insert(kind.key(), (kind.clone(), Running { cancel, task }));
        info!(kind = %kind, "watch registered");
        Ok(true)
    }

    /// Stops the watch for `kind` and drops its cache. Returns whether one was running.
    pub async fn stop_watch(&self, kind: &ObjectKind) -> Result<bool, WatchError> {
        let mut inner = self.inner.lock().await;
        let Some((_, running)) = inner.watches.remove(&kind.key()) else { return Ok(false) };
        stop(running).await;
        self.store.remove_informer(kind).await?;
        info!(kind = %kind, "watch removed");
        Ok(true)
    }

    pub async fn active(&self) -> Vec<ObjectKind> {
        let mut kinds: Vec<ObjectKind> = self.inner.lock().await.watches.values().map(|(k, _)| k.clone()).collect();
        kinds.sort_by_key(|k| k.key());
        kinds
    }

    /// Refuses new watches and stops the running ones.
    pub async fn shutdown(&self) {
        let drained: Vec<(ObjectKind, Running)> = {
            let mut inner = self.inner.lock().await;
            inner.stopping = true;
            inner.watches.drain().map(|(_, v)| v).collect()
        };
        for (kind, running) in drained {
            stop(running).await;
            if let Err(e) = self.store.remove_informer(&kind).await {
                warn!(kind = %kind, error = %e, "removing informer on shutdown");
            }
        }
        info!("watch registry stopped");
    }
}

async fn stop(running: Running) {
    running.cancel.cancel();
    if let Err(e) = running.task.await {
        warn!(error = %e, "watch task failed");
    }
}
