//! One reconciliation pass over a Bundle.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use tether_core::{
    bundle_kind, find_condition, meta, Bundle, BundleStatus, ClientError, ConditionType, DeleteOptions, Graph, ObjectKind,
    ResourceName, BUNDLE_FINALIZER, FOREGROUND_DELETION_FINALIZER,
};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{BundleError, Reason};
use crate::gc;
use crate::index::ObjectRef;
use crate::resource::{ResourceInfo, ResourceSyncTask};
use crate::status::{self, PassResult};

/// What the scheduler should do after a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    /// Run again after this long even without a watch event.
    pub requeue_after: Option<Duration>,
    /// The pass ended in error; retriable errors are retried with backoff.
    pub error: Option<BundleError>,
}

impl SyncOutcome {
    fn failed(e: BundleError) -> Self {
        Self { requeue_after: None, error: Some(e) }
    }
}

pub struct BundleSyncTask<'a> {
    engine: &'a Engine,
    bundle: Bundle,
}

impl<'a> BundleSyncTask<'a> {
    pub fn new(engine: &'a Engine, bundle: Bundle) -> Self {
        Self { engine, bundle }
    }

    pub async fn run(self) -> SyncOutcome {
        let t0 = Instant::now();
        let key = self.bundle.key();
        let outcome = if self.bundle.is_being_deleted() {
            self.delete().await
        } else if !self.bundle.has_delete_finalizer() {
            self.add_finalizer().await
        } else {
            self.process().await
        };
        let result = match &outcome.error {
            None => "ok",
            Some(e) if e.retriable => "retriable",
            Some(_) => "terminal",
        };
        histogram!("bundle_sync_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("bundle_sync_total", 1u64, "result" => result);
        debug!(bundle = %key, result, requeue_after = ?outcome.requeue_after, "pass finished");
        outcome
    }

    async fn write_bundle(&self, bundle: &Bundle) -> Result<(), ClientError> {
        let doc = bundle.to_json().map_err(|e| ClientError::Invalid(e.to_string()))?;
        self.engine.client.update(&bundle_kind(), bundle.namespace(), &doc).await.map(|_| ())
    }

    /// First pass: only make the finalizer durable.
    async fn add_finalizer(&self) -> SyncOutcome {
        let mut next = self.bundle.clone();
        next.add_finalizer(BUNDLE_FINALIZER);
        match self.write_bundle(&next).await {
            Ok(()) => {
                info!(bundle = %self.bundle.key(), "finalizer added");
                SyncOutcome::default()
            }
            Err(e) if e.is_conflict() => SyncOutcome::default(),
            Err(e) => SyncOutcome::failed(BundleError { reason: Reason::WriteFailed, message: e.to_string(), retriable: e.is_retriable() }),
        }
    }

    async fn delete(&self) -> SyncOutcome {
        if !self.bundle.has_delete_finalizer() {
            return SyncOutcome::default();
        }
        let key = self.bundle.key();
        let namespace = self.bundle.namespace();
        if self.bundle.has_finalizer(FOREGROUND_DELETION_FINALIZER) {
            debug!(bundle = %key, "foreground deletion in progress; leaving dependents to the platform");
        } else {
            let controlled = match self.engine.store.list_controlled_by(namespace, self.bundle.uid()).await {
                Ok(c) => c,
                Err(e) => return SyncOutcome::failed(BundleError::retriable(Reason::DeleteFailed, e.to_string())),
            };
            for (kind, obj) in controlled {
                if meta::is_being_deleted(&obj) {
                    continue;
                }
                let Some(name) = meta::name(&obj) else { continue };
                let opts = DeleteOptions { uid: meta::uid(&obj).map(str::to_string), foreground: true };
                match self.engine.client.delete(&kind, namespace, name, &opts).await {
                    Ok(()) => info!(bundle = %key, kind = %kind, name, "deleted"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(bundle = %key, kind = %kind, name, error = %e, "delete failed; keeping finalizer");
                        return SyncOutcome::failed(BundleError::retriable(
                            Reason::DeleteFailed,
                            format!("deleting {} {:?}: {}", kind.kind, name, e),
                        ));
                    }
                }
            }
        }

        let mut next = self.bundle.clone();
        next.remove_finalizer(BUNDLE_FINALIZER);
        match self.write_bundle(&next).await {
            Ok(()) => {
                self.engine.dependents.forget(&key);
                info!(bundle = %key, "finalizer removed");
                SyncOutcome::default()
            }
            Err(e) if e.is_conflict() || e.is_not_found() => SyncOutcome::default(),
            Err(e) => SyncOutcome::failed(BundleError::retriable(Reason::WriteFailed, e.to_string())),
        }
    }

    async fn process(&self) -> SyncOutcome {
        let key = self.bundle.key();
        let mut processed: BTreeMap<ResourceName, ResourceInfo> = BTreeMap::new();
        let mut sequence: Vec<ResourceName> = Vec::new();
        let mut bundle_error: Option<BundleError> = None;
        let mut collected = gc::GcOutcome::default();

        match processing_order(&self.bundle) {
            Err(e) => {
                warn!(bundle = %key, error = %e, "bundle spec rejected");
                bundle_error = Some(e);
            }
            Ok(order) => {
                for name in order {
                    let Some(res) = self.bundle.spec.resources.iter().find(|r| r.name == name) else { continue };
                    let task = ResourceSyncTask::new(self.engine, &self.bundle, &processed);
                    match task.run(res).await {
                        Ok(info) => {
                            processed.insert(name.clone(), info);
                            sequence.push(name);
                        }
                        Err(conflict) => {
                            info!(bundle = %key, %conflict, "write conflict; leaving the rest of the pass to the next event");
                            return SyncOutcome::default();
                        }
                    }
                }

                self.engine.dependents.record(&key, self.dependencies(&processed));

                let declared: Option<Vec<(ObjectKind, String)>> =
                    processed.values().map(|i| Some((i.kind.clone()?, i.object_name.clone()?))).collect();
                match declared {
                    Some(declared) => {
                        collected = gc::collect(self.engine, &self.bundle, &declared, Utc::now()).await;
                        if !collected.errors.is_empty() {
                            bundle_error = Some(BundleError::retriable(Reason::DeleteFailed, collected.errors.join("; ")));
                        }
                    }
                    None => debug!(bundle = %key, "skipping garbage collection: some resource has no identity"),
                }
            }
        }

        let pass = PassResult {
            resources: sequence.iter().filter_map(|n| processed.get(n).map(|i| (n.as_str(), i))).collect(),
            bundle_error: bundle_error.as_ref(),
            objects_to_delete: collected.pending.clone(),
            plugin_statuses: status::plugin_statuses(&self.bundle, &self.engine.plugins),
        };
        let next = status::aggregate(&self.bundle, pass, &status::timestamp());

        if next != self.bundle.status {
            let mut updated = self.bundle.clone();
            updated.status = next.clone();
            let written = match updated.to_json() {
                Ok(doc) => self.engine.client.update_status(&bundle_kind(), self.bundle.namespace(), &doc).await.map(|_| ()),
                Err(e) => Err(ClientError::Invalid(e.to_string())),
            };
            match written {
                Ok(()) => {
                    debug!(bundle = %key, "status updated");
                    for t in raised_conditions(&self.bundle.status, &next) {
                        counter!("bundle_condition_true_total", 1u64, "type" => t.as_str());
                    }
                }
                Err(e) if e.is_conflict() => {
                    debug!(bundle = %key, "status write conflict");
                    return SyncOutcome::default();
                }
                Err(e) => {
                    return SyncOutcome::failed(BundleError::retriable(Reason::StatusWriteFailed, e.to_string()));
                }
            }
        }

        let error = summary_error(&next);
        SyncOutcome { requeue_after: collected.requeue_after, error }
    }

    /// Declared objects plus whatever post-processing read.
    fn dependencies(&self, processed: &BTreeMap<ResourceName, ResourceInfo>) -> Vec<ObjectRef> {
        let namespace = self.bundle.namespace();
        let mut refs = Vec::new();
        for info in processed.values() {
            if let (Some(kind), Some(name)) = (&info.kind, &info.object_name) {
                refs.push(ObjectRef::new(kind, namespace, name));
            }
            refs.extend(info.inputs.iter().cloned());
        }
        refs
    }
}

/// Bundle conditions True in `next` that were not True in `prev`.
fn raised_conditions(prev: &BundleStatus, next: &BundleStatus) -> Vec<ConditionType> {
    next.conditions
        .iter()
        .filter(|c| c.is_true() && !find_condition(&prev.conditions, c.type_).map_or(false, |p| p.is_true()))
        .map(|c| c.type_)
        .collect()
}

/// Resource names in processing order: every resource after the ones it
/// references, ties broken by declaration order.
pub fn processing_order(bundle: &Bundle) -> Result<Vec<ResourceName>, BundleError> {
    let mut graph: Graph<ResourceName> = Graph::new();
    for r in &bundle.spec.resources {
        if !graph.add_vertex(r.name.clone()) {
            return Err(BundleError::terminal(Reason::DuplicateName, format!("duplicate resource name {:?}", r.name)));
        }
    }
    for r in &bundle.spec.resources {
        for reference in &r.references {
            graph
                .add_edge(&r.name, &reference.resource)
                .map_err(|e| BundleError::terminal(Reason::InvalidGraph, format!("resource {:?}: {}", r.name, e)))?;
        }
    }
    graph.topological_sort().map_err(|e| BundleError::terminal(Reason::InvalidGraph, e.to_string()))
}

/// Bundle-level error as recorded in the Error condition.
fn summary_error(s: &BundleStatus) -> Option<BundleError> {
    let c = s.condition(tether_core::ConditionType::Error).filter(|c| c.is_true())?;
    let retriable = c.reason.as_deref() == Some(status::REASON_RETRIABLE);
    let message = c.message.clone().unwrap_or_default();
    Some(if retriable {
        BundleError::retriable(Reason::NotReady, message)
    } else {
        BundleError::terminal(Reason::NotReady, message)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{Condition, ConditionStatus};

    fn status(conditions: &[(ConditionType, ConditionStatus)]) -> BundleStatus {
        BundleStatus {
            conditions: conditions.iter().map(|(t, s)| Condition::new(*t, *s)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn raised_conditions_are_new_transitions_to_true() {
        let prev = status(&[(ConditionType::InProgress, ConditionStatus::True), (ConditionType::Ready, ConditionStatus::False)]);
        let next = status(&[(ConditionType::InProgress, ConditionStatus::True), (ConditionType::Ready, ConditionStatus::True)]);
        assert_eq!(raised_conditions(&prev, &next), vec![ConditionType::Ready]);
        assert!(raised_conditions(&next, &next).is_empty());
        assert_eq!(raised_conditions(&BundleStatus::default(), &prev), vec![ConditionType::InProgress]);
    }
}
