//! Bundle document model.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{meta, CoreError, ObjectKind, BUNDLE_FINALIZER};

pub type ResourceName = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default = "bundle_api_version")]
    pub api_version: String,
    #[serde(default = "bundle_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BundleSpec,
    #[serde(default)]
    pub status: BundleStatus,
}

impl Default for Bundle {
    fn default() -> Self {
        Self {
            api_version: bundle_api_version(),
            kind: bundle_kind(),
            metadata: ObjectMeta::default(),
            spec: BundleSpec::default(),
            status: BundleStatus::default(),
        }
    }
}

fn bundle_api_version() -> String {
    crate::bundle_kind().api_version()
}

fn bundle_kind() -> String {
    crate::BUNDLE_KIND.to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: ResourceName,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
    pub spec: ResourceSpec,
}

/// Exactly one of a concrete object document or a plugin invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceSpec {
    Object(Json),
    Plugin(PluginSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub name: String,
    pub object_name: String,
    #[serde(default)]
    pub spec: serde_json::Map<String, Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    /// Substitution name; unnamed references only order processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub resource: ResourceName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,
}

impl Reference {
    pub fn to(resource: &str) -> Self {
        Self { name: None, resource: resource.to_string(), path: None, example: None, modifier: None }
    }

    pub fn named(name: &str, resource: &str, path: &str) -> Self {
        Self { name: Some(name.to_string()), path: Some(path.to_string()), ..Self::to(resource) }
    }

    pub fn with_example(mut self, example: Json) -> Self {
        self.example = Some(example);
        self
    }

    pub fn with_modifier(mut self, modifier: &str) -> Self {
        self.modifier = Some(modifier.to_string());
        self
    }
}

impl Resource {
    pub fn object(name: &str, object: Json) -> Self {
        Self { name: name.to_string(), references: Vec::new(), spec: ResourceSpec::Object(object) }
    }

    pub fn plugin(name: &str, plugin: &str, object_name: &str, spec: serde_json::Map<String, Json>) -> Self {
        Self {
            name: name.to_string(),
            references: Vec::new(),
            spec: ResourceSpec::Plugin(PluginSpec { name: plugin.to_string(), object_name: object_name.to_string(), spec }),
        }
    }

    pub fn with_references(mut self, references: Vec<Reference>) -> Self {
        self.references = references;
        self
    }

    /// Name the produced object will carry in the cluster.
    pub fn object_name(&self) -> Option<&str> {
        match &self.spec {
            ResourceSpec::Object(obj) => meta::name(obj),
            ResourceSpec::Plugin(p) => Some(p.object_name.as_str()),
        }
    }

    /// Kind of a concrete object spec; plugins resolve their kind via the plugin registry.
    pub fn object_kind(&self) -> Option<Result<ObjectKind, CoreError>> {
        match &self.spec {
            ResourceSpec::Object(obj) => Some(ObjectKind::of(obj)),
            ResourceSpec::Plugin(_) => None,
        }
    }
}

impl Bundle {
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }

    /// `namespace/name` work-queue key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.as_ref().map_or(false, |f| f.iter().any(|x| x == finalizer))
    }

    pub fn has_delete_finalizer(&self) -> bool {
        self.has_finalizer(BUNDLE_FINALIZER)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        let list = self.metadata.finalizers.get_or_insert_with(Vec::new);
        if !list.iter().any(|x| x == finalizer) {
            list.push(finalizer.to_string());
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        if let Some(list) = self.metadata.finalizers.as_mut() {
            list.retain(|x| x != finalizer);
        }
    }

    pub fn from_json(v: Json) -> Result<Self, CoreError> {
        serde_json::from_value(v).map_err(|e| CoreError::InvalidObject(format!("decoding Bundle: {}", e)))
    }

    pub fn to_json(&self) -> Result<Json, CoreError> {
        serde_json::to_value(self).map_err(|e| CoreError::InvalidObject(format!("encoding Bundle: {}", e)))
    }
}

// ---- status ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    InProgress,
    Ready,
    Error,
    Blocked,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::InProgress => "InProgress",
            ConditionType::Ready => "Ready",
            ConditionType::Error => "Error",
            ConditionType::Blocked => "Blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(type_: ConditionType, status: ConditionStatus) -> Self {
        Self { type_, status, last_transition_time: None, reason: None, message: None }
    }

    pub fn with_reason(mut self, reason: &str, message: impl Into<String>) -> Self {
        self.reason = Some(reason.to_string());
        self.message = Some(message.into());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatusEntry {
    pub name: ResourceName,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectToDelete {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginHealth {
    Ok,
    NoSuchPlugin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    pub status: PluginHealth,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_statuses: Vec<ResourceStatusEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects_to_delete: Vec<ObjectToDelete>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugin_statuses: Vec<PluginStatus>,
}

impl BundleStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        find_condition(&self.conditions, type_)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceStatusEntry> {
        self.resource_statuses.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_bundle_document() {
        let doc = json!({
            "apiVersion": "tether.dev/v1",
            "kind": "Bundle",
            "metadata": {"name": "b", "namespace": "ns", "uid": "u-1"},
            "spec": {"resources": [
                {"name": "s", "spec": {"object": {"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s1"}}}},
                {"name": "p", "references": [{"name": "pw", "resource": "s", "path": "data.pw", "example": "x"}],
                 "spec": {"plugin": {"name": "gen", "objectName": "p1", "spec": {"size": 3}}}}
            ]}
        });
        let b = Bundle::from_json(doc).unwrap();
        assert_eq!(b.key(), "ns/b");
        assert_eq!(b.spec.resources.len(), 2);
        assert_eq!(b.spec.resources[0].object_name(), Some("s1"));
        assert_eq!(b.spec.resources[1].object_name(), Some("p1"));
        let r = &b.spec.resources[1].references[0];
        assert_eq!(r.name.as_deref(), Some("pw"));
        assert_eq!(r.example, Some(json!("x")));
        assert!(b.status.conditions.is_empty());
    }

    #[test]
    fn spec_must_be_exactly_one_variant() {
        let both = json!({"name": "x", "spec": {"object": {}, "plugin": {"name": "p", "objectName": "o"}}});
        assert!(serde_json::from_value::<Resource>(both).is_err());
        let neither = json!({"name": "x", "spec": {}});
        assert!(serde_json::from_value::<Resource>(neither).is_err());
    }

    #[test]
    fn finalizers_are_idempotent() {
        let mut b = Bundle::default();
        assert!(!b.has_delete_finalizer());
        b.add_finalizer(BUNDLE_FINALIZER);
        b.add_finalizer(BUNDLE_FINALIZER);
        assert_eq!(b.metadata.finalizers.as_ref().map(|f| f.len()), Some(1));
        b.remove_finalizer(BUNDLE_FINALIZER);
        assert!(!b.has_delete_finalizer());
    }

    #[test]
    fn empty_status_serializes_compactly() {
        let v = serde_json::to_value(BundleStatus::default()).unwrap();
        assert_eq!(v, json!({}));
    }
}
