//! Capability lookup keyed by object kind.
//!
//! Readiness checks, post-processors, output extractors and schemas are all
//! looked up by group+kind (any version). A missing entry is a normal answer,
//! not an error. Registration happens from the kind-discovery task while
//! workers read, so the map is swapped copy-on-write.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tether_core::ObjectKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl From<&ObjectKind> for GroupKind {
    fn from(k: &ObjectKind) -> Self {
        Self { group: k.group.clone(), kind: k.kind.clone() }
    }
}

pub struct KindRegistry<T: ?Sized> {
    map: ArcSwap<FxHashMap<GroupKind, Arc<T>>>,
}

impl<T: ?Sized> Default for KindRegistry<T> {
    fn default() -> Self {
        Self { map: ArcSwap::from_pointee(FxHashMap::default()) }
    }
}

impl<T: ?Sized> KindRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the entry for `kind`'s group and kind.
    pub fn register(&self, kind: &ObjectKind, value: Arc<T>) {
        let key = GroupKind::from(kind);
        self.map.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(key.clone(), value.clone());
            next
        });
    }

    pub fn remove(&self, kind: &ObjectKind) {
        let key = GroupKind::from(kind);
        self.map.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.remove(&key);
            next
        });
    }

    pub fn get(&self, kind: &ObjectKind) -> Option<Arc<T>> {
        self.map.load().get(&GroupKind::from(kind)).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_version() {
        let reg: KindRegistry<str> = KindRegistry::new();
        reg.register(&ObjectKind::new("apps", "v1", "Deployment"), Arc::from("deploy"));
        assert_eq!(reg.get(&ObjectKind::new("apps", "v1beta2", "Deployment")).as_deref(), Some("deploy"));
        assert!(reg.get(&ObjectKind::new("", "v1", "Deployment")).is_none());
        reg.remove(&ObjectKind::new("apps", "v1", "Deployment"));
        assert!(reg.is_empty());
    }
}
