//! Desired-vs-live comparison.
//!
//! The API server fills in defaults, status and bookkeeping metadata, so a
//! live object matches when the desired document is a subset of it. Fields
//! removed from the desired document are not detected; the next spec change
//! that does register rewrites the whole object.

use base64::Engine as _;
use serde_json::{Map, Value as Json};
use tether_core::{well_known, ObjectKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Drops server-populated fields that never take part in a comparison.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for key in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Rewrites write-only fields into the form the server stores them in.
/// A Secret's `stringData` comes back merged into base64 `data`.
pub fn normalize(mut desired: Json) -> Json {
    let is_secret = ObjectKind::of(&desired).map_or(false, |k| k == well_known::secret());
    if !is_secret {
        return desired;
    }
    if let Some(obj) = desired.as_object_mut() {
        if let Some(Json::Object(string_data)) = obj.remove("stringData") {
            let data = obj.entry("data").or_insert_with(|| Json::Object(Map::new()));
            if let Some(data) = data.as_object_mut() {
                for (k, v) in string_data {
                    if let Json::String(s) = v {
                        let encoded = base64::engine::general_purpose::STANDARD.encode(s.as_bytes());
                        data.insert(k, Json::String(encoded));
                    }
                }
            }
        }
    }
    desired
}

fn is_empty_container(v: &Json) -> bool {
    match v {
        Json::Object(m) => m.is_empty(),
        Json::Array(a) => a.is_empty(),
        Json::Null => true,
        _ => false,
    }
}

/// Every field set in `desired` has the same value in `live`.
pub fn is_subset(desired: &Json, live: &Json) -> bool {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => is_subset(dv, lv),
            None => is_empty_container(dv),
        }),
        (Json::Array(d), Json::Array(l)) => d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| is_subset(dv, lv)),
        (Json::Number(d), Json::Number(l)) => d == l || d.as_f64() == l.as_f64(),
        (d, l) => d == l,
    }
}

/// `live` already carries everything `desired` asks for.
pub fn matches(desired: &Json, live: &Json) -> bool {
    is_subset(&strip_noisy(normalize(desired.clone())), &strip_noisy(live.clone()))
}

/// Writes every field of `patch` onto `base`. Objects merge key by key;
/// arrays and scalars replace.
pub fn overlay(base: &mut Json, patch: &Json) {
    match (base, patch) {
        (Json::Object(b), Json::Object(p)) => {
            for (k, pv) in p {
                match b.get_mut(k) {
                    Some(bv) => overlay(bv, pv),
                    None => {
                        b.insert(k.clone(), pv.clone());
                    }
                }
            }
        }
        (b, p) => *b = p.clone(),
    }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) if av != bv => s.updates += 1,
            _ => {}
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let pruned = strip_noisy(json!({
            "metadata": {"name": "x", "managedFields": [{}], "resourceVersion": "1", "generation": 3, "uid": "u"},
            "status": {"ok": true},
            "data": {"k": "v"}
        }));
        assert_eq!(pruned, json!({"metadata": {"name": "x"}, "data": {"k": "v"}}));
    }

    #[test]
    fn live_defaults_do_not_break_matching() {
        let desired = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s", "labels": {}}, "spec": {"ports": [{"port": 80}]}});
        let live = json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "s", "uid": "u", "resourceVersion": "7"},
            "spec": {"ports": [{"port": 80, "protocol": "TCP"}], "clusterIP": "10.0.0.1"},
            "status": {}
        });
        assert!(matches(&desired, &live));

        let changed = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}, "spec": {"ports": [{"port": 81}]}});
        assert!(!matches(&changed, &live));
        let more_ports = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}, "spec": {"ports": [{"port": 80}, {"port": 81}]}});
        assert!(!matches(&more_ports, &live));
    }

    #[test]
    fn secret_string_data_compares_as_data() {
        let desired = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}, "stringData": {"pw": "hunter2"}});
        let live = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}, "data": {"pw": "aHVudGVyMg=="}});
        assert!(matches(&desired, &live));
        let other = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}, "data": {"pw": "b3RoZXI="}});
        assert!(!matches(&desired, &other));
    }

    #[test]
    fn overlay_merges_objects_and_replaces_the_rest() {
        let mut live = json!({"metadata": {"name": "x", "uid": "u"}, "spec": {"a": 1, "list": [1, 2], "keep": true}});
        overlay(&mut live, &json!({"spec": {"a": 2, "list": [3]}, "data": {"k": "v"}}));
        assert_eq!(live, json!({"metadata": {"name": "x", "uid": "u"}, "spec": {"a": 2, "list": [3], "keep": true}, "data": {"k": "v"}}));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        assert_eq!(diff_summary(&target, &base), DiffSummary { adds: 2, updates: 2, removes: 1 });
    }
}
