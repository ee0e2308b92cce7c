//! Kind-specific rewrites applied to the evaluated object before it is
//! written. Each is a pure function of the object, its namespace and the
//! current content of the Secrets/ConfigMaps it points at, so reprocessing an
//! unchanged world yields the same document.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};
use tether_core::{meta, well_known, ObjectKind, ENV_HASH_ANNOTATION, PARAMETERS_CHECKSUM_ANNOTATION};
use tether_store::Store;

use crate::error::{Reason, ResourceError};
use crate::index::ObjectRef;
use crate::registry::KindRegistry;

pub struct PostProcessContext<'a> {
    pub namespace: &'a str,
    /// Live object currently in the cluster, if any.
    pub live: Option<&'a Json>,
    pub store: &'a Store,
    reads: Mutex<Vec<ObjectRef>>,
}

impl<'a> PostProcessContext<'a> {
    pub fn new(namespace: &'a str, live: Option<&'a Json>, store: &'a Store) -> Self {
        Self { namespace, live, store, reads: Mutex::new(Vec::new()) }
    }

    /// Cached lookup in the context namespace; the object is remembered as an input.
    pub async fn lookup(&self, kind: &ObjectKind, name: &str) -> Result<Option<Json>, ResourceError> {
        self.reads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ObjectRef::new(kind, self.namespace, name));
        self.store
            .get(kind, self.namespace, name)
            .await
            .map_err(|e| ResourceError::retriable(Reason::StoreUnavailable, format!("reading {} {}: {}", kind, name, e)))
    }

    /// Every object looked up so far.
    pub fn into_reads(self) -> Vec<ObjectRef> {
        self.reads.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(&self, ctx: &PostProcessContext<'_>, obj: &mut Json) -> Result<(), ResourceError>;
}

pub type PostProcessors = KindRegistry<dyn PostProcessor>;

pub fn builtin_post_processors() -> PostProcessors {
    let reg = PostProcessors::new();
    reg.register(&well_known::deployment(), Arc::new(DeploymentEnvHash));
    reg.register(&well_known::service_instance(), Arc::new(ServiceInstanceChecksum));
    reg
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    ConfigMap(String),
    Secret(String),
}

impl Source {
    fn kind(&self) -> ObjectKind {
        match self {
            Source::ConfigMap(_) => well_known::config_map(),
            Source::Secret(_) => well_known::secret(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Source::ConfigMap(n) | Source::Secret(n) => n,
        }
    }
}

fn str_at<'a>(v: &'a Json, pointer: &str) -> Option<&'a str> {
    v.pointer(pointer).and_then(|s| s.as_str())
}

fn items<'a>(v: &'a Json, key: &str) -> impl Iterator<Item = &'a Json> {
    v.get(key).and_then(|x| x.as_array()).into_iter().flatten()
}

/// Every Secret and ConfigMap a pod spec reads through env, envFrom or volumes.
fn pod_sources(pod: &Json) -> BTreeSet<Source> {
    let mut out = BTreeSet::new();
    for c in items(pod, "containers").chain(items(pod, "initContainers")) {
        for e in items(c, "env") {
            if let Some(n) = str_at(e, "/valueFrom/secretKeyRef/name") {
                out.insert(Source::Secret(n.to_string()));
            }
            if let Some(n) = str_at(e, "/valueFrom/configMapKeyRef/name") {
                out.insert(Source::ConfigMap(n.to_string()));
            }
        }
        for e in items(c, "envFrom") {
            if let Some(n) = str_at(e, "/secretRef/name") {
                out.insert(Source::Secret(n.to_string()));
            }
            if let Some(n) = str_at(e, "/configMapRef/name") {
                out.insert(Source::ConfigMap(n.to_string()));
            }
        }
    }
    for v in items(pod, "volumes") {
        if let Some(n) = str_at(v, "/secret/secretName") {
            out.insert(Source::Secret(n.to_string()));
        }
        if let Some(n) = str_at(v, "/configMap/name") {
            out.insert(Source::ConfigMap(n.to_string()));
        }
        for p in v.pointer("/projected/sources").and_then(|s| s.as_array()).into_iter().flatten() {
            if let Some(n) = str_at(p, "/secret/name") {
                out.insert(Source::Secret(n.to_string()));
            }
            if let Some(n) = str_at(p, "/configMap/name") {
                out.insert(Source::ConfigMap(n.to_string()));
            }
        }
    }
    out
}

/// Feeds `data`/`binaryData` in key order so the digest is independent of map ordering.
fn hash_content(h: &mut Sha256, obj: &Json) {
    for section in ["data", "binaryData"] {
        let Some(map) = obj.get(section).and_then(|d| d.as_object()) else { continue };
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for k in keys {
            h.update(section.as_bytes());
            h.update(b"/");
            h.update(k.as_bytes());
            h.update(b"=");
            h.update(map[k.as_str()].to_string().as_bytes());
            h.update(b"\n");
        }
    }
}

fn object_at<'a>(root: &'a mut Json, path: &[&str]) -> Option<&'a mut Map<String, Json>> {
    let mut cur = root;
    for key in path {
        let map = cur.as_object_mut()?;
        cur = map.entry(key.to_string()).or_insert_with(|| Json::Object(Map::new()));
        if cur.is_null() {
            *cur = Json::Object(Map::new());
        }
    }
    cur.as_object_mut()
}

/// Stamps the pod template with a digest of every Secret/ConfigMap it
/// consumes, so a content change rolls the Deployment.
pub struct DeploymentEnvHash;

#[async_trait]
impl PostProcessor for DeploymentEnvHash {
    async fn process(&self, ctx: &PostProcessContext<'_>, obj: &mut Json) -> Result<(), ResourceError> {
        let sources = match obj.pointer("/spec/template/spec") {
            Some(pod) => pod_sources(pod),
            None => return Ok(()),
        };
        if sources.is_empty() {
            return Ok(());
        }
        let mut h = Sha256::new();
        for src in &sources {
            let kind = src.kind();
            h.update(format!("{}/{}\n", kind.kind, src.name()).as_bytes());
            match ctx.lookup(&kind, src.name()).await? {
                Some(found) => hash_content(&mut h, &found),
                None => h.update(b"<absent>\n"),
            }
        }
        let digest = hex::encode(h.finalize());
        let annotations = object_at(obj, &["spec", "template", "metadata", "annotations"])
            .ok_or_else(|| ResourceError::terminal(Reason::InvalidSpec, "deployment pod template is not an object"))?;
        annotations.insert(ENV_HASH_ANNOTATION.to_string(), Json::String(digest));
        Ok(())
    }
}

/// Checksums the Secret values a ServiceInstance draws parameters from and
/// bumps `spec.updateRequests` when they change, so the broker re-reads them.
pub struct ServiceInstanceChecksum;

#[async_trait]
impl PostProcessor for ServiceInstanceChecksum {
    async fn process(&self, ctx: &PostProcessContext<'_>, obj: &mut Json) -> Result<(), ResourceError> {
        let refs: Vec<(String, String)> = obj
            .pointer("/spec/parametersFrom")
            .and_then(|p| p.as_array())
            .into_iter()
            .flatten()
            .filter_map(|p| Some((str_at(p, "/secretKeyRef/name")?.to_string(), str_at(p, "/secretKeyRef/key")?.to_string())))
            .collect();
        if refs.is_empty() {
            return Ok(());
        }
        let mut h = Sha256::new();
        for (name, key) in &refs {
            h.update(format!("{}/{}=", name, key).as_bytes());
            match ctx.lookup(&well_known::secret(), name).await? {
                Some(secret) => match secret.get("data").and_then(|d| d.get(key.as_str())) {
                    Some(v) => h.update(v.to_string().as_bytes()),
                    None => h.update(b"<absent>"),
                },
                None => h.update(b"<absent>"),
            }
            h.update(b"\n");
        }
        let checksum = hex::encode(h.finalize());
        meta::set_annotation(obj, PARAMETERS_CHECKSUM_ANNOTATION, &checksum);

        if let Some(live) = ctx.live {
            let live_requests = live.pointer("/spec/updateRequests").and_then(|v| v.as_i64()).unwrap_or(0);
            let wanted = obj.pointer("/spec/updateRequests").and_then(|v| v.as_i64()).unwrap_or(0);
            let changed = meta::annotation(live, PARAMETERS_CHECKSUM_ANNOTATION).map_or(false, |c| c != checksum);
            let requests = live_requests.max(wanted) + i64::from(changed);
            if requests > 0 {
                if let Some(spec) = object_at(obj, &["spec"]) {
                    spec.insert("updateRequests".into(), Json::from(requests));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_every_pod_source() {
        let pod = json!({
            "containers": [{
                "env": [
                    {"name": "A", "valueFrom": {"secretKeyRef": {"name": "s1", "key": "k"}}},
                    {"name": "B", "valueFrom": {"configMapKeyRef": {"name": "c1", "key": "k"}}},
                    {"name": "C", "value": "plain"}
                ],
                "envFrom": [{"secretRef": {"name": "s2"}}]
            }],
            "initContainers": [{"envFrom": [{"configMapRef": {"name": "c2"}}]}],
            "volumes": [
                {"name": "v", "secret": {"secretName": "s1"}},
                {"name": "p", "projected": {"sources": [{"configMap": {"name": "c3"}}]}}
            ]
        });
        let got: Vec<Source> = pod_sources(&pod).into_iter().collect();
        assert_eq!(
            got,
            vec![
                Source::ConfigMap("c1".into()),
                Source::ConfigMap("c2".into()),
                Source::ConfigMap("c3".into()),
                Source::Secret("s1".into()),
                Source::Secret("s2".into()),
            ]
        );
    }

    #[test]
    fn content_hash_is_key_order_independent() {
        let mut a = Sha256::new();
        hash_content(&mut a, &json!({"data": {"x": "1", "y": "2"}}));
        let mut b = Sha256::new();
        hash_content(&mut b, &json!({"data": {"y": "2", "x": "1"}}));
        assert_eq!(a.finalize(), b.finalize());
    }
}
