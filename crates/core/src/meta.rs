//! Accessors for `metadata` on untyped object documents, plus owner-reference helpers.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::{Map, Value as Json};

use crate::Bundle;

fn meta(obj: &Json) -> Option<&Map<String, Json>> {
    obj.get("metadata").and_then(|m| m.as_object())
}

fn meta_mut(obj: &mut Json) -> Option<&mut Map<String, Json>> {
    let map = obj.as_object_mut()?;
    let m = map.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    if !m.is_object() {
        *m = Json::Object(Map::new());
    }
    m.as_object_mut()
}

fn meta_str<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    meta(obj).and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

pub fn name(obj: &Json) -> Option<&str> {
    meta_str(obj, "name")
}

pub fn namespace(obj: &Json) -> Option<&str> {
    meta_str(obj, "namespace")
}

pub fn uid(obj: &Json) -> Option<&str> {
    meta_str(obj, "uid")
}

pub fn resource_version(obj: &Json) -> Option<&str> {
    meta_str(obj, "resourceVersion")
}

pub fn is_being_deleted(obj: &Json) -> bool {
    meta(obj).and_then(|m| m.get("deletionTimestamp")).map_or(false, |v| !v.is_null())
}

pub fn set_name(obj: &mut Json, name: &str) {
    if let Some(m) = meta_mut(obj) {
        m.insert("name".into(), Json::String(name.to_string()));
    }
}

pub fn set_namespace(obj: &mut Json, ns: &str) {
    if let Some(m) = meta_mut(obj) {
        m.insert("namespace".into(), Json::String(ns.to_string()));
    }
}

pub fn set_resource_version(obj: &mut Json, rv: &str) {
    if let Some(m) = meta_mut(obj) {
        m.insert("resourceVersion".into(), Json::String(rv.to_string()));
    }
}

fn string_map(obj: &Json, key: &str) -> Vec<(String, String)> {
    meta(obj)
        .and_then(|m| m.get(key))
        .and_then(|v| v.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

pub fn labels(obj: &Json) -> Vec<(String, String)> {
    string_map(obj, "labels")
}

pub fn annotations(obj: &Json) -> Vec<(String, String)> {
    string_map(obj, "annotations")
}

pub fn annotation<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    meta(obj)
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_str())
}

fn set_entry(obj: &mut Json, section: &str, key: &str, value: &str) {
    if let Some(m) = meta_mut(obj) {
        let sec = m.entry(section).or_insert_with(|| Json::Object(Map::new()));
        if !sec.is_object() {
            *sec = Json::Object(Map::new());
        }
        if let Some(sec) = sec.as_object_mut() {
            sec.insert(key.to_string(), Json::String(value.to_string()));
        }
    }
}

pub fn set_label(obj: &mut Json, key: &str, value: &str) {
    set_entry(obj, "labels", key, value);
}

pub fn set_annotation(obj: &mut Json, key: &str, value: &str) {
    set_entry(obj, "annotations", key, value);
}

pub fn remove_annotation(obj: &mut Json, key: &str) {
    if let Some(a) = obj.pointer_mut("/metadata/annotations").and_then(|a| a.as_object_mut()) {
        a.remove(key);
    }
}

pub fn owner_references(obj: &Json) -> Vec<OwnerReference> {
    meta(obj)
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|v| serde_json::from_value::<Vec<OwnerReference>>(v.clone()).ok())
        .unwrap_or_default()
}

pub fn set_owner_references(obj: &mut Json, refs: &[OwnerReference]) {
    if let Some(m) = meta_mut(obj) {
        match serde_json::to_value(refs) {
            Ok(v) if !refs.is_empty() => {
                m.insert("ownerReferences".into(), v);
            }
            _ => {
                m.remove("ownerReferences");
            }
        }
    }
}

pub fn controller_of(obj: &Json) -> Option<OwnerReference> {
    owner_references(obj).into_iter().find(|r| r.controller == Some(true))
}

pub fn is_controlled_by(obj: &Json, owner_uid: &str) -> bool {
    controller_of(obj).map_or(false, |r| r.uid == owner_uid)
}

/// Controller reference from a managed object back to its Bundle.
pub fn bundle_owner_ref(bundle: &Bundle) -> OwnerReference {
    OwnerReference {
        api_version: bundle.api_version.clone(),
        kind: bundle.kind.clone(),
        name: bundle.name().to_string(),
        uid: bundle.uid().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Non-controller reference to a dependency's live object.
pub fn dependency_owner_ref(actual: &Json) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: actual.get("apiVersion")?.as_str()?.to_string(),
        kind: actual.get("kind")?.as_str()?.to_string(),
        name: name(actual)?.to_string(),
        uid: uid(actual)?.to_string(),
        controller: None,
        block_owner_deletion: Some(true),
    })
}
