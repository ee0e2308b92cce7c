//! In-memory cluster for engine tests: implements `ObjectClient` and feeds
//! the Store through informer channels, the way a watch would.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Map, Value as Json};
use tether_core::{bundle_kind, meta, Bundle, ClientError, DeleteOptions, ObjectClient, ObjectKind, Resource};
use tether_reconcile::{Engine, PluginRegistry};
use tether_store::{Delta, Store};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Json>,
    informers: BTreeMap<String, mpsc::Sender<Delta>>,
    next_uid: u64,
    next_rv: u64,
    writes: Vec<String>,
    fail_deletes: bool,
    held: Option<Vec<(String, Delta)>>,
}

#[derive(Default)]
pub struct FakeCluster {
    inner: Mutex<Inner>,
}

fn key(kind: &ObjectKind, namespace: &str, name: &str) -> Key {
    (kind.key(), namespace.to_string(), name.to_string())
}

fn string_data_to_data(obj: &mut Json) {
    let Some(map) = obj.as_object_mut() else { return };
    let Some(Json::Object(sd)) = map.remove("stringData") else { return };
    let data = map.entry("data").or_insert_with(|| Json::Object(Map::new()));
    if let Some(data) = data.as_object_mut() {
        for (k, v) in sd {
            let s = v.as_str().unwrap_or_default().to_string();
            data.insert(k, Json::String(base64::engine::general_purpose::STANDARD.encode(s)));
        }
    }
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn publish(&mut self, kind: &ObjectKind, delta: Delta) {
        if let Some(held) = self.held.as_mut() {
            held.push((kind.key(), delta));
            return;
        }
        self.send(&kind.key(), delta);
    }

    fn send(&self, kind: &str, delta: Delta) {
        if let Some(tx) = self.informers.get(kind) {
            tx.try_send(delta).expect("informer channel full");
        }
    }
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an informer for `kind` with the store, seeded with what exists.
    pub async fn watch(&self, store: &Store, kind: ObjectKind) {
        let (tx, rx) = mpsc::channel(1024);
        {
            let mut inner = self.inner.lock().unwrap();
            let current: Vec<Json> =
                inner.objects.iter().filter(|((k, _, _), _)| *k == kind.key()).map(|(_, v)| v.clone()).collect();
            tx.try_send(Delta::Restarted(current)).unwrap();
            inner.informers.insert(kind.key(), tx);
        }
        store.add_informer(kind, rx).await.unwrap();
    }

    /// Puts an object in place as if someone else created it.
    pub fn seed(&self, kind: &ObjectKind, mut obj: Json) -> Json {
        let mut inner = self.inner.lock().unwrap();
        inner.next_uid += 1;
        let uid = format!("uid-{}", inner.next_uid);
        let rv = inner.bump_rv();
        kind.stamp(&mut obj);
        if meta::uid(&obj).is_none() {
            obj["metadata"]["uid"] = json!(uid);
        }
        if obj.pointer("/metadata/generation").is_none() {
            obj["metadata"]["generation"] = json!(1);
        }
        meta::set_resource_version(&mut obj, &rv);
        string_data_to_data(&mut obj);
        let ns = meta::namespace(&obj).unwrap_or_default().to_string();
        let name = meta::name(&obj).unwrap_or_default().to_string();
        inner.objects.insert(key(kind, &ns, &name), obj.clone());
        inner.publish(kind, Delta::Applied(obj.clone()));
        obj
    }

    pub fn object(&self, kind: &ObjectKind, namespace: &str, name: &str) -> Option<Json> {
        self.inner.lock().unwrap().objects.get(&key(kind, namespace, name)).cloned()
    }

    pub fn bundle(&self, namespace: &str, name: &str) -> Bundle {
        Bundle::from_json(self.object(&bundle_kind(), namespace, name).expect("bundle exists")).unwrap()
    }

    /// Marks the object deleted (or removes it when nothing holds it).
    pub async fn request_delete(&self, kind: &ObjectKind, namespace: &str, name: &str) {
        self.delete(kind, namespace, name, &DeleteOptions::default()).await.unwrap();
    }

    pub fn writes(&self) -> Vec<String> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// Writes other than Bundle status updates.
    pub fn object_writes(&self) -> Vec<String> {
        self.writes().into_iter().filter(|w| !w.starts_with("update_status ")).collect()
    }

    /// While held, changes are applied but watchers do not see them.
    /// Releasing delivers everything held, in order.
    pub fn hold_events(&self, hold: bool) {
        let mut inner = self.inner.lock().unwrap();
        if hold {
            inner.held.get_or_insert_with(Vec::new);
        } else if let Some(held) = inner.held.take() {
            for (kind, delta) in held {
                inner.send(&kind, delta);
            }
        }
    }

    pub fn clear_writes(&self) {
        self.inner.lock().unwrap().writes.clear();
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_deletes = fail;
    }
}

#[async_trait]
impl ObjectClient for FakeCluster {
    async fn create(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError> {
        let mut inner = self.inner.lock().unwrap();
        let name = meta::name(obj).unwrap_or_default().to_string();
        let k = key(kind, namespace, &name);
        if inner.objects.contains_key(&k) {
            return Err(ClientError::AlreadyExists(name));
        }
        let mut obj = obj.clone();
        inner.next_uid += 1;
        obj["metadata"]["uid"] = json!(format!("uid-{}", inner.next_uid));
        obj["metadata"]["generation"] = json!(1);
        let rv = inner.bump_rv();
        meta::set_resource_version(&mut obj, &rv);
        string_data_to_data(&mut obj);
        inner.writes.push(format!("create {}/{}", kind.kind, name));
        inner.objects.insert(k, obj.clone());
        inner.publish(kind, Delta::Applied(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError> {
        let mut inner = self.inner.lock().unwrap();
        let name = meta::name(obj).unwrap_or_default().to_string();
        let k = key(kind, namespace, &name);
        let Some(live) = inner.objects.get(&k).cloned() else { return Err(ClientError::NotFound(name)) };
        if let Some(rv) = meta::resource_version(obj) {
            if Some(rv) != meta::resource_version(&live) {
                return Err(ClientError::Conflict(format!("{} has been modified", name)));
            }
        }
        let mut next = obj.clone();
        string_data_to_data(&mut next);
        next["metadata"]["uid"] = live["metadata"]["uid"].clone();
        match live.get("status") {
            Some(s) => next["status"] = s.clone(),
            None => {
                if let Some(m) = next.as_object_mut() {
                    m.remove("status");
                }
            }
        }
        let generation = live["metadata"]["generation"].as_i64().unwrap_or(1);
        next["metadata"]["generation"] = json!(if next.get("spec") != live.get("spec") { generation + 1 } else { generation });
        if let Some(ts) = live.pointer("/metadata/deletionTimestamp") {
            next["metadata"]["deletionTimestamp"] = ts.clone();
        }
        let rv = inner.bump_rv();
        meta::set_resource_version(&mut next, &rv);
        inner.writes.push(format!("update {}/{}", kind.kind, name));

        let finalized = next.pointer("/metadata/finalizers").and_then(|f| f.as_array()).map_or(true, |f| f.is_empty());
        if meta::is_being_deleted(&next) && finalized {
            inner.objects.remove(&k);
            inner.publish(kind, Delta::Deleted(next.clone()));
        } else {
            inner.objects.insert(k, next.clone());
            inner.publish(kind, Delta::Applied(next.clone()));
        }
        Ok(next)
    }

    async fn update_status(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError> {
        let mut inner = self.inner.lock().unwrap();
        let name = meta::name(obj).unwrap_or_default().to_string();
        let k = key(kind, namespace, &name);
        let Some(mut live) = inner.objects.get(&k).cloned() else { return Err(ClientError::NotFound(name)) };
        if let Some(rv) = meta::resource_version(obj) {
            if Some(rv) != meta::resource_version(&live) {
                return Err(ClientError::Conflict(format!("{} has been modified", name)));
            }
        }
        live["status"] = obj.get("status").cloned().unwrap_or(Json::Null);
        inner.writes.push(format!("update_status {}/{}", kind.kind, name));
        let rv = inner.bump_rv();
        meta::set_resource_version(&mut live, &rv);
        inner.objects.insert(k, live.clone());
        inner.publish(kind, Delta::Applied(live.clone()));
        Ok(live)
    }

    async fn delete(&self, kind: &ObjectKind, namespace: &str, name: &str, opts: &DeleteOptions) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_deletes {
            return Err(ClientError::Other("delete refused".into()));
        }
        let k = key(kind, namespace, name);
        let Some(mut live) = inner.objects.get(&k).cloned() else { return Err(ClientError::NotFound(name.to_string())) };
        if let Some(uid) = &opts.uid {
            if meta::uid(&live) != Some(uid.as_str()) {
                return Err(ClientError::Conflict(format!("uid precondition failed for {}", name)));
            }
        }
        inner.writes.push(format!("delete {}/{}", kind.kind, name));
        let held = live.pointer("/metadata/finalizers").and_then(|f| f.as_array()).map_or(false, |f| !f.is_empty());
        if held {
            live["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
            let rv = inner.bump_rv();
            meta::set_resource_version(&mut live, &rv);
            inner.objects.insert(k, live.clone());
            inner.publish(kind, Delta::Applied(live));
        } else {
            inner.objects.remove(&k);
            inner.publish(kind, Delta::Deleted(live));
        }
        Ok(())
    }
}

pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub store: Store,
    pub engine: Engine,
}

/// Store and engine wired to a fresh cluster watching `kinds` plus Bundles.
pub async fn harness(kinds: &[ObjectKind], plugins: PluginRegistry) -> Harness {
    let cluster = FakeCluster::new();
    let (store, _loop) = Store::spawn(CancellationToken::new());
    cluster.watch(&store, bundle_kind()).await;
    for k in kinds {
        cluster.watch(&store, k.clone()).await;
    }
    let engine = Engine::new(store.clone(), cluster.clone(), plugins);
    Harness { cluster, store, engine }
}

pub fn bundle_doc(name: &str, resources: Vec<Resource>) -> Json {
    let mut b = Bundle::default();
    b.metadata.name = Some(name.to_string());
    b.metadata.namespace = Some("ns".to_string());
    b.spec.resources = resources;
    b.to_json().unwrap()
}

impl Harness {
    pub fn create_bundle(&self, name: &str, resources: Vec<Resource>) -> Bundle {
        Bundle::from_json(self.cluster.seed(&bundle_kind(), bundle_doc(name, resources))).unwrap()
    }

    /// Replaces the bundle's resources, as a user edit would.
    pub async fn edit_bundle(&self, name: &str, resources: Vec<Resource>) -> Bundle {
        let mut b = self.cluster.bundle("ns", name);
        b.spec.resources = resources;
        let doc = self.cluster.update(&bundle_kind(), "ns", &b.to_json().unwrap()).await.unwrap();
        Bundle::from_json(doc).unwrap()
    }

    pub fn current(&self, name: &str) -> Bundle {
        self.cluster.bundle("ns", name)
    }
}
