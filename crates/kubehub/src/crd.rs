//! CRD-driven kind discovery.
//!
//! A CRD opts in with `tether.dev/watch: "true"`. Once it is Established its
//! storage version is watched, its `openAPIV3Schema` backs pre-validation and
//! the optional ready-path annotations register a ready checker.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tether_core::{meta, well_known, ObjectKind, CRD_WATCH_ANNOTATION};
use tether_reconcile::ready::AnnotationReady;
use tether_reconcile::Engine;
use tether_store::ObjectEvent;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{WatchError, WatchRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedCrd {
    pub kind: ObjectKind,
    pub schema: Option<Json>,
}

fn established(crd: &Json) -> bool {
    crd.pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .map_or(false, |c| c.iter().any(|c| c["type"] == "Established" && c["status"] == "True"))
}

/// The kind a CRD makes manageable, if it opted in and is established.
pub fn accepted(crd: &Json) -> Option<AcceptedCrd> {
    if meta::annotation(crd, CRD_WATCH_ANNOTATION) != Some("true") || !established(crd) {
        return None;
    }
    let group = crd.pointer("/spec/group")?.as_str()?;
    let kind = crd.pointer("/spec/names/kind")?.as_str()?;
    let versions = crd.pointer("/spec/versions")?.as_array()?;
    let version = versions
        .iter()
        .find(|v| v["storage"] == true)
        .or_else(|| versions.iter().find(|v| v["served"] == true))?;
    Some(AcceptedCrd {
        kind: ObjectKind::new(group, version["name"].as_str()?, kind),
        schema: version.pointer("/schema/openAPIV3Schema").cloned(),
    })
}

pub struct CrdDiscovery {
    registry: Arc<WatchRegistry>,
    engine: Arc<Engine>,
    /// Kinds started on behalf of each CRD, by CRD name.
    known: Mutex<FxHashMap<String, ObjectKind>>,
}

impl CrdDiscovery {
    pub fn new(registry: Arc<WatchRegistry>, engine: Arc<Engine>) -> Self {
        Self { registry, engine, known: Mutex::new(FxHashMap::default()) }
    }

    async fn forget(&self, kind: &ObjectKind) {
        if let Err(e) = self.registry.stop_watch(kind).await {
            warn!(kind = %kind, error = %e, "stopping watch");
        }
        self.engine.schemas.remove(kind);
        self.engine.ready.remove(kind);
        info!(kind = %kind, "kind no longer managed");
    }

    /// Applies one CRD event. Other kinds are ignored.
    pub async fn handle(&self, ev: &ObjectEvent) -> Result<(), WatchError> {
        if !ev.kind.same_group_kind(&well_known::crd()) {
            return Ok(());
        }
        let Some(name) = meta::name(&ev.object) else { return Ok(()) };
        let wanted = if ev.deleted { None } else { accepted(&ev.object) };
        let mut known = self.known.lock().await;

        let previous = known.get(name).cloned();
        if let Some(prev) = &previous {
            if wanted.as_ref().map_or(true, |w| w.kind != *prev) {
                known.remove(name);
                self.forget(prev).await;
            }
        }
        let Some(crd) = wanted else { return Ok(()) };

        if self.registry.ensure_watch(&crd.kind).await? {
            info!(crd = name, kind = %crd.kind, "managing discovered kind");
        }
        match &crd.schema {
            Some(schema) => {
                if let Err(e) = self.engine.schemas.register(&crd.kind, schema) {
                    warn!(kind = %crd.kind, error = %e, "CRD schema does not compile; skipping pre-validation");
                    self.engine.schemas.remove(&crd.kind);
                }
            }
            None => self.engine.schemas.remove(&crd.kind),
        }
        match AnnotationReady::from_crd(&ev.object) {
            Some(checker) => self.engine.ready.register(&crd.kind, Arc::new(checker)),
            None => self.engine.ready.remove(&crd.kind),
        }
        known.insert(name.to_string(), crd.kind);
        Ok(())
    }

    /// Watches CRDs and follows them until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), WatchError> {
        let mut events = self.engine.store.subscribe()?;
        self.registry.ensure_watch(&well_known::crd()).await?;
        loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => ev,
            };
            let Some(ev) = ev else { break };
            if let Err(e) = self.handle(&ev).await {
                warn!(error = %e, "handling CRD event");
            }
        }
        debug!("CRD discovery stopped");
        Ok(())
    }
}
