//! Per-resource processing within one bundle pass.
//!
//! A resource moves through pre-validation, the dependency gate, lookup of
//! the live object, evaluation of its spec, kind-specific post-processing,
//! the idempotent write, a post-write consistency check and finally the
//! readiness check. The outcome is one of Ready, InProgress, Blocked or Error;
//! a write conflict aborts the pass instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;
use tether_core::{
    meta, Bundle, ClientError, ObjectKind, Resource, ResourceName, ResourceSpec, BUNDLE_NAME_LABEL, ORPHANED_AT_ANNOTATION,
};
use tether_resolve::{ResolvedDependency, SecretOutput, SpecProcessor};
use tether_store::StoreError;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::compare;
use crate::engine::Engine;
use crate::index::ObjectRef;
use crate::error::{Conflict, Reason, ResourceError};
use crate::plugin::{Plugin, PluginContext};
use crate::postprocess::PostProcessContext;
use crate::schema;

pub type Blockers = SmallVec<[ResourceName; 4]>;

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceState {
    Ready,
    InProgress,
    /// Waiting on these dependencies, in reference order.
    Blocked(Blockers),
    Error(ResourceError),
}

/// Result of processing one resource; lives for a single pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub kind: Option<ObjectKind>,
    pub object_name: Option<String>,
    pub actual: Option<Json>,
    pub state: ResourceState,
    pub secret_output: Option<SecretOutput>,
    /// Objects read by post-processing; their changes concern the Bundle too.
    pub inputs: Vec<ObjectRef>,
}

impl ResourceInfo {
    fn failed(kind: Option<ObjectKind>, object_name: Option<String>, err: ResourceError) -> Self {
        Self { kind, object_name, actual: None, state: ResourceState::Error(err), secret_output: None, inputs: Vec::new() }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ResourceState::Ready
    }

    pub fn error(&self) -> Option<&ResourceError> {
        match &self.state {
            ResourceState::Error(e) => Some(e),
            _ => None,
        }
    }

    fn as_dependency(&self) -> ResolvedDependency {
        ResolvedDependency { actual: self.actual.clone(), secret_output: self.secret_output.clone() }
    }
}

enum Step {
    Failed(ResourceError),
    Conflict(Conflict),
}

impl From<ResourceError> for Step {
    fn from(e: ResourceError) -> Self {
        Step::Failed(e)
    }
}

pub struct ResourceSyncTask<'a> {
    engine: &'a Engine,
    bundle: &'a Bundle,
    processed: &'a BTreeMap<ResourceName, ResourceInfo>,
}

impl<'a> ResourceSyncTask<'a> {
    /// `processed` holds the results of every resource earlier in topological order.
    pub fn new(engine: &'a Engine, bundle: &'a Bundle, processed: &'a BTreeMap<ResourceName, ResourceInfo>) -> Self {
        Self { engine, bundle, processed }
    }

    pub async fn run(&self, res: &Resource) -> Result<ResourceInfo, Conflict> {
        let (kind, name, plugin) = match self.identify(res) {
            Ok(id) => id,
            Err(e) => return Ok(ResourceInfo::failed(None, res.object_name().map(str::to_string), e)),
        };
        let mut info = ResourceInfo {
            kind: Some(kind.clone()),
            object_name: Some(name.clone()),
            actual: None,
            state: ResourceState::InProgress,
            secret_output: None,
            inputs: Vec::new(),
        };
        match self.sync(res, &kind, &name, plugin.as_deref(), &mut info).await {
            Ok(state) => info.state = state,
            Err(Step::Failed(e)) => {
                debug!(bundle = %self.bundle.key(), resource = %res.name, reason = %e.reason, error = %e.message, "resource failed");
                info.state = ResourceState::Error(e);
            }
            Err(Step::Conflict(c)) => return Err(c),
        }
        Ok(info)
    }

    /// Kind and object name of what the resource produces.
    fn identify(&self, res: &Resource) -> Result<(ObjectKind, String, Option<Arc<dyn Plugin>>), ResourceError> {
        match &res.spec {
            ResourceSpec::Object(obj) => {
                let kind = ObjectKind::of(obj).map_err(|e| ResourceError::terminal(Reason::InvalidSpec, e.to_string()))?;
                let name = meta::name(obj)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| ResourceError::terminal(Reason::InvalidSpec, "object has no metadata.name"))?;
                Ok((kind, name.to_string(), None))
            }
            ResourceSpec::Plugin(p) => {
                let plugin = self
                    .engine
                    .plugins
                    .get(&p.name)
                    .ok_or_else(|| ResourceError::terminal(Reason::NoSuchPlugin, format!("plugin {:?} is not registered", p.name)))?;
                if p.object_name.is_empty() {
                    return Err(ResourceError::terminal(Reason::InvalidSpec, "plugin objectName is empty"));
                }
                Ok((plugin.describe().kind, p.object_name.clone(), Some(plugin)))
            }
        }
    }

    async fn sync(
        &self,
        res: &Resource,
        kind: &ObjectKind,
        name: &str,
        plugin: Option<&dyn Plugin>,
        info: &mut ResourceInfo,
    ) -> Result<ResourceState, Step> {
        self.prevalidate(res, kind, plugin)?;

        let blockers = self.unready_dependencies(res);
        if !blockers.is_empty() {
            return Ok(ResourceState::Blocked(blockers));
        }

        let actual = self.fetch_actual(kind, name).await?;
        let deps = self.dependencies(res);
        let mut desired = self.evaluate(res, kind, name, plugin, actual.as_ref(), &deps)?;

        if let Some(post) = self.engine.post.get(kind) {
            let ctx = PostProcessContext::new(self.bundle.namespace(), actual.as_ref(), &self.engine.store);
            let processed = post.process(&ctx, &mut desired).await;
            info.inputs = ctx.into_reads();
            processed?;
        }

        let written = self.write(res, kind, &desired, actual).await?;
        info.actual = Some(written.clone());

        let state = match self.engine.ready.get(kind) {
            None => ResourceState::Ready,
            Some(checker) => match checker.is_ready(&written) {
                Ok(true) => ResourceState::Ready,
                Ok(false) => ResourceState::InProgress,
                Err(e) => ResourceState::Error(ResourceError { reason: Reason::NotReady, message: e.message, retriable: e.retriable }),
            },
        };
        if state == ResourceState::Ready {
            if let Some(extractor) = self.engine.outputs.get(kind) {
                info.secret_output = Some(extractor.extract(&written, &self.engine.store).await?);
            }
        }
        Ok(state)
    }

    /// Substitutes declared examples and checks the result against the
    /// kind's schema. Skipped when some reference has no example.
    fn prevalidate(&self, res: &Resource, kind: &ObjectKind, plugin: Option<&dyn Plugin>) -> Result<(), ResourceError> {
        let processor = match SpecProcessor::example(&res.references) {
            Ok(p) => p,
            Err(e) if e.is_no_example() => {
                debug!(resource = %res.name, "skipping pre-validation: {}", e);
                return Ok(());
            }
            Err(e) => return Err(ResourceError::terminal(Reason::InvalidSpec, e.to_string())),
        };
        let invalid = |e: tether_resolve::ResolveError| ResourceError::terminal(Reason::InvalidSpec, e.to_string());
        let violations = match (&res.spec, plugin) {
            (ResourceSpec::Object(obj), _) => {
                let mut doc = obj.clone();
                processor.process(&mut doc).map_err(invalid)?;
                self.engine.schemas.validate(kind, &doc)
            }
            (ResourceSpec::Plugin(p), Some(plugin)) => {
                let mut spec = p.spec.clone();
                processor.process_map(&mut spec).map_err(invalid)?;
                plugin.validate_spec(&spec).map_err(|e| ResourceError {
                    reason: Reason::ValidationFailed,
                    message: e.message,
                    retriable: e.retriable,
                })?;
                match plugin.describe().spec_schema {
                    Some(raw) => {
                        let compiled =
                            schema::compile(&raw).map_err(|e| ResourceError::terminal(Reason::ValidationFailed, e))?;
                        schema::violations(&compiled, &Json::Object(spec))
                    }
                    None => Vec::new(),
                }
            }
            (ResourceSpec::Plugin(_), None) => Vec::new(),
        };
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ResourceError::terminal(Reason::ValidationFailed, violations.join("; ")))
        }
    }

    fn unready_dependencies(&self, res: &Resource) -> Blockers {
        let mut out = Blockers::new();
        for r in &res.references {
            let ready = self.processed.get(&r.resource).map_or(false, |i| i.is_ready());
            if !ready && !out.contains(&r.resource) {
                out.push(r.resource.clone());
            }
        }
        out
    }

    fn dependencies(&self, res: &Resource) -> BTreeMap<ResourceName, ResolvedDependency> {
        res.references
            .iter()
            .filter_map(|r| self.processed.get(&r.resource).map(|i| (r.resource.clone(), i.as_dependency())))
            .collect()
    }

    async fn fetch_actual(&self, kind: &ObjectKind, name: &str) -> Result<Option<Json>, ResourceError> {
        let found = match self.engine.store.get(kind, self.bundle.namespace(), name).await {
            Ok(found) => found,
            Err(StoreError::NoInformer(k)) => {
                return Err(ResourceError::retriable(Reason::StoreUnavailable, format!("kind {} is not watched", k)))
            }
            Err(e) => return Err(ResourceError::retriable(Reason::StoreUnavailable, e.to_string())),
        };
        let Some(obj) = found else { return Ok(None) };
        if meta::is_being_deleted(&obj) {
            return Err(ResourceError::terminal(Reason::BeingDeleted, format!("{} {:?} is being deleted", kind.kind, name)));
        }
        if !meta::is_controlled_by(&obj, self.bundle.uid()) {
            return Err(ResourceError::terminal(
                Reason::NotOwned,
                format!("{} {:?} is not owned by the Bundle", kind.kind, name),
            ));
        }
        Ok(Some(obj))
    }

    fn evaluate(
        &self,
        res: &Resource,
        kind: &ObjectKind,
        name: &str,
        plugin: Option<&dyn Plugin>,
        actual: Option<&Json>,
        deps: &BTreeMap<ResourceName, ResolvedDependency>,
    ) -> Result<Json, ResourceError> {
        let resolve_failed = |e: tether_resolve::ResolveError| ResourceError {
            reason: Reason::ResolveFailed,
            retriable: e.is_retriable(),
            message: e.to_string(),
        };
        let processor = SpecProcessor::real(&res.references, deps).map_err(resolve_failed)?;
        let namespace = self.bundle.namespace();

        let mut obj = match (&res.spec, plugin) {
            (ResourceSpec::Object(o), _) => {
                let mut o = o.clone();
                processor.process(&mut o).map_err(resolve_failed)?;
                o
            }
            (ResourceSpec::Plugin(p), Some(plugin)) => {
                let mut spec = p.spec.clone();
                processor.process_map(&mut spec).map_err(resolve_failed)?;
                let ctx = PluginContext { namespace, actual, dependencies: deps };
                plugin.process(&spec, &ctx).map_err(|e| ResourceError {
                    reason: Reason::PluginFailed,
                    message: e.message,
                    retriable: e.retriable,
                })?
            }
            (ResourceSpec::Plugin(p), None) => {
                return Err(ResourceError::terminal(Reason::NoSuchPlugin, format!("plugin {:?} is not registered", p.name)))
            }
        };
        if !obj.is_object() {
            return Err(ResourceError::terminal(Reason::InvalidSpec, "evaluated spec is not an object"));
        }

        kind.stamp(&mut obj);
        meta::set_namespace(&mut obj, namespace);
        meta::set_name(&mut obj, name);

        let own: Map<String, Json> = obj.pointer("/metadata/labels").and_then(|l| l.as_object()).cloned().unwrap_or_default();
        for (k, v) in self.bundle.metadata.labels.iter().flatten() {
            if !own.contains_key(k) {
                meta::set_label(&mut obj, k, v);
            }
        }
        meta::set_label(&mut obj, BUNDLE_NAME_LABEL, self.bundle.name());

        let mut refs = meta::owner_references(&obj);
        if let Some(c) = refs.iter().find(|r| r.controller == Some(true)) {
            return Err(ResourceError::terminal(
                Reason::InvalidSpec,
                format!("spec declares controller owner reference to {} {:?}", c.kind, c.name),
            ));
        }
        refs.push(meta::bundle_owner_ref(self.bundle));
        for r in &res.references {
            let Some(dep) = self.processed.get(&r.resource).and_then(|i| i.actual.as_ref()) else { continue };
            let Some(owner) = meta::dependency_owner_ref(dep) else { continue };
            if !refs.iter().any(|x| x.uid == owner.uid) {
                refs.push(owner);
            }
        }
        meta::set_owner_references(&mut obj, &refs);
        Ok(obj)
    }

    /// Waits, up to the engine's settle timeout, until the Store holds the
    /// revision just written so later resources in this pass read it. A wait
    /// that ends any other way is logged and the pass goes on.
    async fn settle(&self, kind: &ObjectKind, written: &Json) {
        let (Some(name), Some(rv)) = (meta::name(written), meta::resource_version(written)) else { return };
        let rv = rv.to_string();
        let deadline = Instant::now() + self.engine.settle_timeout;
        let seen = self
            .engine
            .store
            .await_object_condition(&self.engine.shutdown, Some(deadline), kind, self.bundle.namespace(), name, move |o| {
                meta::resource_version(o).map_or(false, |seen| revision_reached(seen, &rv))
            })
            .await;
        if let Err(e) = seen {
            debug!(bundle = %self.bundle.key(), kind = %kind, name, error = %e, "write not yet visible in the store");
        }
    }

    async fn write(&self, res: &Resource, kind: &ObjectKind, desired: &Json, actual: Option<Json>) -> Result<Json, Step> {
        let namespace = self.bundle.namespace();
        let client = &self.engine.client;
        let conflict_or_fail = |e: ClientError| {
            if e.is_conflict() {
                Step::Conflict(Conflict { resource: res.name.clone(), message: e.to_string() })
            } else {
                Step::Failed(ResourceError::from_client(Reason::WriteFailed, &e))
            }
        };

        let written = match actual {
            None => {
                let created = client.create(kind, namespace, desired).await.map_err(conflict_or_fail)?;
                counter!("resource_writes_total", 1u64, "op" => "create");
                info!(bundle = %self.bundle.key(), resource = %res.name, kind = %kind, "created");
                created
            }
            Some(live) => {
                let orphan_marked = meta::annotation(&live, ORPHANED_AT_ANNOTATION).is_some();
                if !orphan_marked && compare::matches(desired, &live) {
                    debug!(bundle = %self.bundle.key(), resource = %res.name, "up to date");
                    return Ok(live);
                }
                let mut next = live;
                compare::overlay(&mut next, desired);
                meta::remove_annotation(&mut next, ORPHANED_AT_ANNOTATION);
                if let Some(m) = next.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    m.remove("managedFields");
                }
                let updated = client.update(kind, namespace, &next).await.map_err(conflict_or_fail)?;
                counter!("resource_writes_total", 1u64, "op" => "update");
                info!(bundle = %self.bundle.key(), resource = %res.name, kind = %kind, "updated");
                updated
            }
        };

        self.settle(kind, &written).await;

        if !compare::matches(desired, &written) {
            let d = compare::diff_summary(
                &compare::strip_noisy(compare::normalize(desired.clone())),
                &compare::strip_noisy(written.clone()),
            );
            return Err(Step::Failed(ResourceError::terminal(
                Reason::SpecMismatch,
                format!(
                    "object differs from spec after write ({} missing, {} changed); another writer may be fighting over it",
                    d.adds, d.updates
                ),
            )));
        }
        Ok(written)
    }
}

/// Revisions are opaque; numeric ones may also have moved past `written`.
fn revision_reached(seen: &str, written: &str) -> bool {
    if seen == written {
        return true;
    }
    matches!((seen.parse::<u64>(), written.parse::<u64>()), (Ok(s), Ok(w)) if s > w)
}

#[cfg(test)]
mod tests {
    use super::revision_reached;

    #[test]
    fn revision_reached_accepts_equal_or_later_numeric() {
        assert!(revision_reached("42", "42"));
        assert!(revision_reached("43", "42"));
        assert!(!revision_reached("41", "42"));
        assert!(revision_reached("abc", "abc"));
        assert!(!revision_reached("abd", "abc"));
    }
}
