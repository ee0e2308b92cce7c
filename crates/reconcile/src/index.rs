//! Reverse index from objects to the Bundles whose last pass looked at them.
//!
//! Owner references only name objects a Bundle already controls. An object it
//! declares but does not own yet (a foreign object in the way, or one not
//! created) and the Secrets/ConfigMaps read while post-processing carry no
//! such link, so events on them are routed through this index instead.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tether_core::{meta, ObjectKind};

/// Group, kind, namespace and name. Versions are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: &ObjectKind, namespace: &str, name: &str) -> Self {
        Self { group: kind.group.clone(), kind: kind.kind.clone(), namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn of(kind: &ObjectKind, obj: &Json) -> Option<Self> {
        Some(Self::new(kind, meta::namespace(obj).unwrap_or(""), meta::name(obj)?))
    }
}

#[derive(Default)]
struct Inner {
    by_object: FxHashMap<ObjectRef, BTreeSet<String>>,
    by_bundle: FxHashMap<String, Vec<ObjectRef>>,
}

impl Inner {
    fn unlink(&mut self, bundle: &str) {
        for obj in self.by_bundle.remove(bundle).unwrap_or_default() {
            if let Some(keys) = self.by_object.get_mut(&obj) {
                keys.remove(bundle);
                if keys.is_empty() {
                    self.by_object.remove(&obj);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct DependentIndex {
    inner: Mutex<Inner>,
}

impl DependentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces everything recorded for `bundle` with `objects`.
    pub fn record(&self, bundle: &str, objects: impl IntoIterator<Item = ObjectRef>) {
        let mut objects: Vec<ObjectRef> = objects.into_iter().collect();
        objects.sort();
        objects.dedup();
        let mut inner = self.lock();
        inner.unlink(bundle);
        for obj in &objects {
            inner.by_object.entry(obj.clone()).or_default().insert(bundle.to_string());
        }
        if !objects.is_empty() {
            inner.by_bundle.insert(bundle.to_string(), objects);
        }
    }

    pub fn forget(&self, bundle: &str) {
        self.lock().unlink(bundle);
    }

    /// Bundle keys that looked at `obj` during their last pass, sorted.
    pub fn bundles_for(&self, kind: &ObjectKind, obj: &Json) -> Vec<String> {
        let Some(r) = ObjectRef::of(kind, obj) else { return Vec::new() };
        self.lock().by_object.get(&r).map(|keys| keys.iter().cloned().collect()).unwrap_or_default()
    }

    /// Number of distinct objects tracked.
    pub fn len(&self) -> usize {
        self.lock().by_object.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::well_known;

    fn secret(name: &str) -> Json {
        json!({"metadata": {"name": name, "namespace": "ns"}})
    }

    #[test]
    fn routes_objects_to_the_bundles_that_read_them() {
        let idx = DependentIndex::new();
        let s = well_known::secret();
        idx.record("ns/a", vec![ObjectRef::new(&s, "ns", "db"), ObjectRef::new(&s, "ns", "db")]);
        idx.record("ns/b", vec![ObjectRef::new(&s, "ns", "db"), ObjectRef::new(&s, "ns", "other")]);

        assert_eq!(idx.bundles_for(&s, &secret("db")), vec!["ns/a".to_string(), "ns/b".to_string()]);
        assert_eq!(idx.bundles_for(&s, &secret("other")), vec!["ns/b".to_string()]);
        assert!(idx.bundles_for(&well_known::config_map(), &secret("db")).is_empty());
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn versions_do_not_split_entries() {
        let idx = DependentIndex::new();
        idx.record("ns/a", vec![ObjectRef::new(&ObjectKind::new("example.io", "v1", "Db"), "ns", "x")]);
        let seen = idx.bundles_for(&ObjectKind::new("example.io", "v2", "Db"), &secret("x"));
        assert_eq!(seen, vec!["ns/a".to_string()]);
    }

    #[test]
    fn record_replaces_and_forget_clears() {
        let idx = DependentIndex::new();
        let s = well_known::secret();
        idx.record("ns/a", vec![ObjectRef::new(&s, "ns", "old")]);
        idx.record("ns/a", vec![ObjectRef::new(&s, "ns", "new")]);
        assert!(idx.bundles_for(&s, &secret("old")).is_empty());
        assert_eq!(idx.bundles_for(&s, &secret("new")), vec!["ns/a".to_string()]);

        idx.forget("ns/a");
        assert!(idx.is_empty());
    }
}
