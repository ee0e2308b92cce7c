//! Tether store: a watch-fed object cache owned by a single control loop.
//!
//! Every read, write and subscription is a message into one task, so an
//! arriving watch event and a newly registered waiter can never interleave
//! badly: registration checks the cached object before subscribing, and a
//! waiter is either answered immediately or parked until the next transition.
//! Values handed out are always clones; no caller shares state with the cache.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tether_core::{meta, ObjectKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One watch notification for an informer's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Applied(Json),
    Deleted(Json),
    /// Full relist; replaces the cached set wholesale.
    Restarted(Vec<Json>),
}

/// Change notification published to subscribers after the cache is updated.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEvent {
    pub kind: ObjectKind,
    pub object: Json,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no informer registered for {0}")]
    NoInformer(ObjectKind),
    #[error("informer for {0} is already registered")]
    InformerExists(ObjectKind),
    #[error("informer for {0} was removed")]
    InformerRemoved(ObjectKind),
    #[error("wait cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("store loop stopped")]
    Stopped,
}

type ObjKey = (String, String);
type Predicate = Box<dyn Fn(&Json) -> bool + Send>;

enum Request {
    AddInformer { kind: ObjectKind, source: mpsc::Receiver<Delta>, reply: oneshot::Sender<Result<(), StoreError>> },
    RemoveInformer { kind: ObjectKind, reply: oneshot::Sender<Result<(), StoreError>> },
    Get { kind: ObjectKind, key: ObjKey, reply: oneshot::Sender<Result<Option<Json>, StoreError>> },
    List { kind: ObjectKind, namespace: Option<String>, reply: oneshot::Sender<Result<Vec<Json>, StoreError>> },
    ListControlled { namespace: String, uid: String, reply: oneshot::Sender<Vec<(ObjectKind, Json)>> },
    Await { id: u64, kind: ObjectKind, key: ObjKey, predicate: Predicate, reply: oneshot::Sender<Result<Json, StoreError>> },
    Unsubscribe { id: u64 },
    Subscribe { tx: mpsc::UnboundedSender<ObjectEvent> },
    Kinds { reply: oneshot::Sender<Vec<ObjectKind>> },
    WaiterCount { reply: oneshot::Sender<usize> },
}

/// Cloneable handle to the store loop.
#[derive(Clone)]
pub struct Store {
    tx: mpsc::UnboundedSender<Request>,
    next_id: Arc<AtomicU64>,
}

impl Store {
    /// Spawn the control loop. It runs until `shutdown` fires or every handle is dropped.
    pub fn spawn(shutdown: CancellationToken) -> (Store, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_loop(rx, shutdown));
        (Store { tx, next_id: Arc::new(AtomicU64::new(1)) }, handle)
    }

    fn send(&self, req: Request) -> Result<(), StoreError> {
        self.tx.send(req).map_err(|_| StoreError::Stopped)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| StoreError::Stopped)
    }

    /// Register a watch source for `kind`. Registering the same kind twice is refused.
    pub async fn add_informer(&self, kind: ObjectKind, source: mpsc::Receiver<Delta>) -> Result<(), StoreError> {
        self.call(|reply| Request::AddInformer { kind, source, reply }).await?
    }

    /// Drop the informer and its cache; parked waiters for the kind fail with
    /// `InformerRemoved`, as do later reads of the kind until it is added again.
    pub async fn remove_informer(&self, kind: &ObjectKind) -> Result<(), StoreError> {
        let kind = kind.clone();
        self.call(|reply| Request::RemoveInformer { kind, reply }).await?
    }

    /// Point lookup. `namespace` is empty for cluster-scoped kinds.
    pub async fn get(&self, kind: &ObjectKind, namespace: &str, name: &str) -> Result<Option<Json>, StoreError> {
        let kind = kind.clone();
        let key = (namespace.to_string(), name.to_string());
        self.call(|reply| Request::Get { kind, key, reply }).await?
    }

    /// All cached objects of `kind`, optionally limited to one namespace, sorted by namespace/name.
    pub async fn list(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Vec<Json>, StoreError> {
        let kind = kind.clone();
        let namespace = namespace.map(|s| s.to_string());
        self.call(|reply| Request::List { kind, namespace, reply }).await?
    }

    /// Every cached object in `namespace`, of any kind, whose controller reference has `uid`.
    pub async fn list_controlled_by(&self, namespace: &str, uid: &str) -> Result<Vec<(ObjectKind, Json)>, StoreError> {
        let namespace = namespace.to_string();
        let uid = uid.to_string();
        self.call(|reply| Request::ListControlled { namespace, uid, reply }).await
    }

    /// Wait until the object exists and satisfies `predicate`.
    ///
    /// Resolves immediately when the cached object already matches. Ends with
    /// `Cancelled` or `DeadlineExceeded` if those come first; the registration
    /// is always withdrawn on the way out, also when the future is dropped.
    pub async fn await_object_condition<P>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        kind: &ObjectKind,
        namespace: &str,
        name: &str,
        predicate: P,
    ) -> Result<Json, StoreError>
    where
        P: Fn(&Json) -> bool + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.send(Request::Await {
            id,
            kind: kind.clone(),
            key: (namespace.to_string(), name.to_string()),
            predicate: Box::new(predicate),
            reply,
        })?;
        let _guard = WaiterGuard { tx: self.tx.clone(), id };
        tokio::select! {
            res = rx => res.unwrap_or(Err(StoreError::Stopped)),
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            _ = deadline_elapsed(deadline) => Err(StoreError::DeadlineExceeded),
        }
    }

    /// Change feed of every cache transition made after this call.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ObjectEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Request::Subscribe { tx })?;
        Ok(rx)
    }

    pub async fn kinds(&self) -> Result<Vec<ObjectKind>, StoreError> {
        self.call(|reply| Request::Kinds { reply }).await
    }

    /// Number of parked waiters.
    pub async fn waiter_count(&self) -> Result<usize, StoreError> {
        self.call(|reply| Request::WaiterCount { reply }).await
    }
}

fn deadline_elapsed(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    }
}

/// Withdraws a waiter registration. Unknown ids are ignored by the loop, so
/// this also runs after a waiter has already been answered.
struct WaiterGuard {
    tx: mpsc::UnboundedSender<Request>,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Unsubscribe { id: self.id });
    }
}

struct Waiter {
    kind: ObjectKind,
    key: ObjKey,
    predicate: Predicate,
    reply: oneshot::Sender<Result<Json, StoreError>>,
}

#[derive(Default)]
struct State {
    caches: FxHashMap<ObjectKind, FxHashMap<ObjKey, Json>>,
    waiters: FxHashMap<u64, Waiter>,
    subscribers: Vec<mpsc::UnboundedSender<ObjectEvent>>,
    /// Kinds whose informer was removed and not added back.
    removed: FxHashSet<ObjectKind>,
}

fn object_key(obj: &Json) -> Option<ObjKey> {
    let name = meta::name(obj)?;
    Some((meta::namespace(obj).unwrap_or("").to_string(), name.to_string()))
}

async fn run_loop(mut rx: mpsc::UnboundedReceiver<Request>, shutdown: CancellationToken) {
    let mut state = State::default();
    let mut sources: StreamMap<ObjectKind, ReceiverStream<Delta>> = StreamMap::new();
    loop {
        // Deltas win over requests so a delta sent before a request is visible to it.
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("store shutdown requested");
                break;
            }
            Some((kind, delta)) = sources.next(), if !sources.is_empty() => {
                state.apply(&kind, delta);
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(Request::AddInformer { kind, source, reply }) => {
                        let res = if state.caches.contains_key(&kind) {
                            warn!(kind = %kind, "informer registered twice");
                            Err(StoreError::InformerExists(kind))
                        } else {
                            info!(kind = %kind, "informer added");
                            state.removed.remove(&kind);
                            state.caches.insert(kind.clone(), FxHashMap::default());
                            sources.insert(kind, ReceiverStream::new(source));
                            Ok(())
                        };
                        let _ = reply.send(res);
                    }
                    Some(Request::RemoveInformer { kind, reply }) => {
                        let res = if state.caches.remove(&kind).is_some() {
                            sources.remove(&kind);
                            state.fail_waiters(&kind);
                            state.removed.insert(kind.clone());
                            info!(kind = %kind, "informer removed");
                            Ok(())
                        } else {
                            Err(StoreError::NoInformer(kind))
                        };
                        let _ = reply.send(res);
                    }
                    Some(other) => state.handle(other),
                    None => break,
                }
            }
        }
    }
    for (_, w) in state.waiters.drain() {
        let _ = w.reply.send(Err(StoreError::Stopped));
    }
    info!("store loop stopped");
}

impl State {
    fn missing(&self, kind: ObjectKind) -> StoreError {
        if self.removed.contains(&kind) {
            StoreError::InformerRemoved(kind)
        } else {
            StoreError::NoInformer(kind)
        }
    }

    fn handle(&mut self, req: Request) {
        match req {
            Request::Get { kind, key, reply } => {
                let res = match self.caches.get(&kind) {
                    Some(cache) => Ok(cache.get(&key).cloned()),
                    None => Err(self.missing(kind)),
                };
                let _ = reply.send(res);
            }
            Request::List { kind, namespace, reply } => {
                let res = match self.caches.get(&kind) {
                    Some(cache) => {
                        let mut items: Vec<(&ObjKey, &Json)> = cache
                            .iter()
                            .filter(|(k, _)| namespace.as_deref().map_or(true, |ns| k.0 == ns))
                            .collect();
                        items.sort_by(|a, b| a.0.cmp(b.0));
                        Ok(items.into_iter().map(|(_, v)| v.clone()).collect())
                    }
                    None => Err(self.missing(kind)),
                };
                let _ = reply.send(res);
            }
            Request::ListControlled { namespace, uid, reply } => {
                let mut out: Vec<(ObjectKind, Json)> = Vec::new();
                for (kind, cache) in self.caches.iter() {
                    for ((ns, _), obj) in cache.iter() {
                        if *ns == namespace && meta::is_controlled_by(obj, &uid) {
                            out.push((kind.clone(), obj.clone()));
                        }
                    }
                }
                out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| meta::name(&a.1).cmp(&meta::name(&b.1))));
                let _ = reply.send(out);
            }
            Request::Await { id, kind, key, predicate, reply } => {
                let Some(cache) = self.caches.get(&kind) else {
                    let _ = reply.send(Err(self.missing(kind)));
                    return;
                };
                if let Some(obj) = cache.get(&key) {
                    if predicate(obj) {
                        let _ = reply.send(Ok(obj.clone()));
                        return;
                    }
                }
                self.waiters.insert(id, Waiter { kind, key, predicate, reply });
                metrics::gauge!("store_waiters", self.waiters.len() as f64);
            }
            Request::Unsubscribe { id } => {
                if self.waiters.remove(&id).is_some() {
                    debug!(id, "waiter withdrawn");
                    metrics::gauge!("store_waiters", self.waiters.len() as f64);
                }
            }
            Request::Subscribe { tx } => self.subscribers.push(tx),
            Request::Kinds { reply } => {
                let mut kinds: Vec<ObjectKind> = self.caches.keys().cloned().collect();
                kinds.sort();
                let _ = reply.send(kinds);
            }
            Request::WaiterCount { reply } => {
                let _ = reply.send(self.waiters.len());
            }
            Request::AddInformer { .. } | Request::RemoveInformer { .. } => {}
        }
    }

    fn apply(&mut self, kind: &ObjectKind, delta: Delta) {
        if !self.caches.contains_key(kind) {
            return;
        }
        metrics::counter!("store_events_total", 1u64);
        match delta {
            Delta::Applied(obj) => self.upsert(kind, obj),
            Delta::Deleted(obj) => {
                if let Some(key) = object_key(&obj) {
                    let removed = self.caches.get_mut(kind).and_then(|c| c.remove(&key));
                    if let Some(mut old) = removed {
                        kind.stamp(&mut old);
                        self.publish(kind, old, true);
                    }
                }
            }
            Delta::Restarted(list) => {
                let mut fresh: FxHashMap<ObjKey, Json> = FxHashMap::default();
                for mut obj in list {
                    if let Some(key) = object_key(&obj) {
                        kind.stamp(&mut obj);
                        fresh.insert(key, obj);
                    }
                }
                let old = self.caches.insert(kind.clone(), FxHashMap::default()).unwrap_or_default();
                for (key, obj) in old {
                    if !fresh.contains_key(&key) {
                        self.publish(kind, obj, true);
                    }
                }
                debug!(kind = %kind, count = fresh.len(), "informer relisted");
                for (_, obj) in fresh {
                    self.upsert(kind, obj);
                }
            }
        }
    }

    fn upsert(&mut self, kind: &ObjectKind, mut obj: Json) {
        let Some(key) = object_key(&obj) else {
            warn!(kind = %kind, "dropping object without metadata.name");
            return;
        };
        kind.stamp(&mut obj);
        if let Some(cache) = self.caches.get_mut(kind) {
            cache.insert(key.clone(), obj.clone());
        }
        self.wake(kind, &key, &obj);
        self.publish(kind, obj, false);
    }

    fn wake(&mut self, kind: &ObjectKind, key: &ObjKey, obj: &Json) {
        let ready: Vec<u64> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.kind == *kind && w.key == *key && (w.predicate)(obj))
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(w) = self.waiters.remove(&id) {
                let _ = w.reply.send(Ok(obj.clone()));
            }
        }
        metrics::gauge!("store_waiters", self.waiters.len() as f64);
    }

    fn fail_waiters(&mut self, kind: &ObjectKind) {
        let ids: Vec<u64> = self.waiters.iter().filter(|(_, w)| w.kind == *kind).map(|(id, _)| *id).collect();
        for id in ids {
            if let Some(w) = self.waiters.remove(&id) {
                let _ = w.reply.send(Err(StoreError::InformerRemoved(kind.clone())));
            }
        }
        metrics::gauge!("store_waiters", self.waiters.len() as f64);
    }

    fn publish(&mut self, kind: &ObjectKind, object: Json, deleted: bool) {
        if self.subscribers.is_empty() {
            return;
        }
        let ev = ObjectEvent { kind: kind.clone(), object, deleted };
        self.subscribers.retain(|tx| tx.send(ev.clone()).is_ok());
    }
}
