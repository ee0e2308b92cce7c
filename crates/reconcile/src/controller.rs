//! Controller loop: maps store events to bundle keys and runs passes on a
//! bounded worker pool.

use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use rustc_hash::FxHashMap;
use tether_core::{bundle_kind, meta, Bundle, API_GROUP, BUNDLE_KIND};
use tether_store::{ObjectEvent, StoreError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundle::{BundleSyncTask, SyncOutcome};
use crate::config::Config;
use crate::engine::Engine;
use crate::queue::WorkQueue;

/// Bundle keys an event should wake: the Bundle itself, or every Bundle
/// named in the object's owner references.
pub fn bundle_keys(ev: &ObjectEvent) -> Vec<String> {
    let namespace = meta::namespace(&ev.object).unwrap_or("default");
    if ev.kind.same_group_kind(&bundle_kind()) {
        return meta::name(&ev.object).map(|n| vec![format!("{}/{}", namespace, n)]).unwrap_or_default();
    }
    let mut keys: Vec<String> = Vec::new();
    for r in meta::owner_references(&ev.object) {
        let group = r.api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
        if r.kind != BUNDLE_KIND || group != API_GROUP {
            continue;
        }
        let key = format!("{}/{}", namespace, r.name);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

pub struct Controller {
    engine: Arc<Engine>,
    config: Config,
    queue: Arc<WorkQueue>,
    attempts: Mutex<FxHashMap<String, u32>>,
}

impl Controller {
    pub fn new(engine: Arc<Engine>, config: Config) -> Self {
        let queue = Arc::new(WorkQueue::with_capacity(config.queue_cap));
        Self { engine, config, queue, attempts: Mutex::new(FxHashMap::default()) }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    fn in_scope(&self, key: &str) -> bool {
        match &self.config.namespace {
            Some(ns) => key.split_once('/').map_or(false, |(k, _)| k == ns),
            None => true,
        }
    }

    /// In-scope Bundles an event should wake, including those whose last
    /// pass declared or read the object without owning it.
    fn keys_for(&self, ev: &ObjectEvent) -> Vec<String> {
        let mut keys = bundle_keys(ev);
        if !ev.kind.same_group_kind(&bundle_kind()) {
            keys.extend(self.engine.dependents.bundles_for(&ev.kind, &ev.object));
        }
        keys.sort();
        keys.dedup();
        keys.retain(|k| self.in_scope(k));
        keys
    }

    /// Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), StoreError> {
        let mut events = self.engine.store.subscribe()?;
        info!(workers = self.config.workers, resync_secs = self.config.resync.as_secs(), "controller started");

        let mut tasks = Vec::with_capacity(self.config.workers + 2);

        let this = self.clone();
        let stop = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    ev = events.recv() => match ev {
                        Some(ev) => {
                            for key in this.keys_for(&ev) {
                                this.queue.add(&key).await;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("event pump stopped");
        }));

        let this = self.clone();
        let stop = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.resync);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.resync().await {
                            warn!(error = %e, "resync failed");
                        }
                    }
                }
            }
        }));

        for id in 0..self.config.workers.max(1) {
            let this = self.clone();
            let stop = cancel.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(key) = this.queue.next(&stop).await {
                    let outcome = this.reconcile_key(&key).await;
                    this.queue.done(&key).await;
                    if let Some(outcome) = outcome {
                        this.after(&key, outcome, &stop).await;
                    }
                    let depth = this.queue.len().await;
                    gauge!("workqueue_depth", depth as f64);
                }
                debug!(worker = id, "worker stopped");
            }));
        }

        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "controller task failed");
            }
        }
        info!("controller stopped");
        Ok(())
    }

    /// Enqueues every cached Bundle.
    pub async fn resync(&self) -> Result<usize, StoreError> {
        let bundles = self.engine.store.list(&bundle_kind(), self.config.namespace.as_deref()).await?;
        let mut n = 0;
        for b in &bundles {
            let Some(name) = meta::name(b) else { continue };
            let key = format!("{}/{}", meta::namespace(b).unwrap_or("default"), name);
            if self.queue.add(&key).await {
                n += 1;
            }
        }
        debug!(queued = n, total = bundles.len(), "resync");
        Ok(n)
    }

    /// One pass for `key`. `None` when the Bundle is gone or unreadable.
    pub async fn reconcile_key(&self, key: &str) -> Option<SyncOutcome> {
        let (namespace, name) = key.split_once('/')?;
        let doc = match self.engine.store.get(&bundle_kind(), namespace, name).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                debug!(bundle = %key, "bundle gone");
                self.attempts.lock().await.remove(key);
                self.engine.dependents.forget(key);
                return None;
            }
            Err(e) => {
                warn!(bundle = %key, error = %e, "reading bundle failed");
                return None;
            }
        };
        let bundle = match Bundle::from_json(doc) {
            Ok(b) => b,
            Err(e) => {
                warn!(bundle = %key, error = %e, "undecodable bundle; waiting for a change");
                return None;
            }
        };
        Some(BundleSyncTask::new(&self.engine, bundle).run().await)
    }

    /// Schedules the follow-up run an outcome asks for.
    async fn after(&self, key: &str, outcome: SyncOutcome, cancel: &CancellationToken) {
        let delay = match &outcome.error {
            Some(e) if e.retriable => {
                let mut attempts = self.attempts.lock().await;
                let n = attempts.entry(key.to_string()).or_insert(0);
                *n = n.saturating_add(1);
                let d = self.config.backoff(*n);
                debug!(bundle = %key, attempt = *n, delay_secs = d.as_secs(), error = %e, "retrying");
                Some(outcome.requeue_after.map_or(d, |r| r.min(d)))
            }
            Some(e) => {
                self.attempts.lock().await.remove(key);
                info!(bundle = %key, error = %e, "terminal error; waiting for a change");
                outcome.requeue_after
            }
            None => {
                self.attempts.lock().await.remove(key);
                outcome.requeue_after
            }
        };
        if let Some(d) = delay {
            self.schedule(key.to_string(), d, cancel.clone());
        }
    }

    fn schedule(&self, key: String, delay: Duration, cancel: CancellationToken) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.add(&key).await;
                }
            }
        });
    }
}
