//! Tether kubehub: kube-rs wiring for the reconciler.
//!
//! Discovery of served resources, list+watch loops feeding the Store, the
//! `ObjectClient` over `DynamicObject`, and CRD-driven dynamic watches.

#![forbid(unsafe_code)]

pub mod client;
pub mod crd;
pub mod registry;

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client,
};
use serde_json::Value as Json;
use tether_core::ObjectKind;
use tether_store::Delta;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use client::KubeObjectClient;
pub use crd::CrdDiscovery;
pub use registry::{KubeWatchSource, WatchError, WatchRegistry, WatchSource};

/// Served resources by kind key, refreshed from discovery on a miss.
pub struct Resolver {
    client: Client,
    cache: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl Resolver {
    pub fn new(client: Client) -> Self {
        Self { client, cache: Mutex::new(HashMap::new()) }
    }

    async fn refresh(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut cache = self.cache.lock().await;
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let kind = ObjectKind::new(&ar.group, &ar.version, &ar.kind);
                    cache.insert(kind.key(), (ar, namespaced));
                }
            }
        }
        debug!(resources = cache.len(), "discovery refreshed");
        Ok(())
    }

    /// API resource for `kind` and whether it is namespaced.
    pub async fn find(&self, kind: &ObjectKind) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.cache.lock().await.get(&kind.key()).cloned() {
            return Ok(hit);
        }
        self.refresh().await?;
        self.cache
            .lock()
            .await
            .get(&kind.key())
            .cloned()
            .ok_or_else(|| anyhow!("kind not served: {}", kind))
    }

    /// Dynamic API for `kind`, scoped to `namespace` when the kind is namespaced.
    pub async fn api(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find(kind).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn to_json(obj: &DynamicObject) -> Option<Json> {
    match serde_json::to_value(obj) {
        Ok(mut v) => {
            strip_managed_fields(&mut v);
            Some(v)
        }
        Err(e) => {
            warn!(error = %e, "serializing DynamicObject");
            None
        }
    }
}

/// List+watch `api`, forwarding every event to `tx` until `cancel` fires or
/// the receiving informer goes away.
pub async fn run_watcher(kind: ObjectKind, api: Api<DynamicObject>, tx: mpsc::Sender<Delta>, cancel: CancellationToken) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, "watcher started");
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        let delta = match ev {
            None => break,
            Some(Err(e)) => {
                warn!(kind = %kind, error = %e, "watch error; backing off");
                continue;
            }
            Some(Ok(Event::Applied(o))) => to_json(&o).map(Delta::Applied),
            Some(Ok(Event::Deleted(o))) => to_json(&o).map(Delta::Deleted),
            Some(Ok(Event::Restarted(list))) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                Some(Delta::Restarted(list.iter().filter_map(to_json).collect()))
            }
        };
        let Some(delta) = delta else { continue };
        if tx.send(delta).await.is_err() {
            debug!(kind = %kind, "informer closed");
            break;
        }
    }
    info!(kind = %kind, "watcher stopped");
}
