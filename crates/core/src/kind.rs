use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::CoreError;

/// Group/Version/Kind of a watched object type.
///
/// Rendered as the same key format used on the command line:
/// `v1/Secret` for the core group, `apps/v1/Deployment` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ObjectKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(CoreError::InvalidKind(format!("{} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    /// `apiVersion` as written in object documents.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Kind of an object document, read from its `apiVersion` and `kind` fields.
    pub fn of(obj: &Json) -> Result<Self, CoreError> {
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::InvalidObject("object missing apiVersion".into()))?;
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::InvalidObject("object missing kind".into()))?;
        if kind.is_empty() {
            return Err(CoreError::InvalidObject("object has empty kind".into()));
        }
        Ok(Self::from_api_version(api_version, kind))
    }

    /// Same group and kind, any version. Owner references and GC compare this way.
    pub fn same_group_kind(&self, other: &ObjectKind) -> bool {
        self.group == other.group && self.kind == other.kind
    }

    /// Write `apiVersion`/`kind` into an object document.
    pub fn stamp(&self, obj: &mut Json) {
        if let Some(map) = obj.as_object_mut() {
            map.insert("apiVersion".into(), Json::String(self.api_version()));
            map.insert("kind".into(), Json::String(self.kind.clone()));
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

pub mod well_known {
    use super::ObjectKind;

    pub fn secret() -> ObjectKind { ObjectKind::new("", "v1", "Secret") }
    pub fn config_map() -> ObjectKind { ObjectKind::new("", "v1", "ConfigMap") }
    pub fn service() -> ObjectKind { ObjectKind::new("", "v1", "Service") }
    pub fn service_account() -> ObjectKind { ObjectKind::new("", "v1", "ServiceAccount") }
    pub fn deployment() -> ObjectKind { ObjectKind::new("apps", "v1", "Deployment") }
    pub fn ingress() -> ObjectKind { ObjectKind::new("networking.k8s.io", "v1", "Ingress") }
    pub fn service_instance() -> ObjectKind { ObjectKind::new("servicecatalog.k8s.io", "v1beta1", "ServiceInstance") }
    pub fn service_binding() -> ObjectKind { ObjectKind::new("servicecatalog.k8s.io", "v1beta1", "ServiceBinding") }
    pub fn crd() -> ObjectKind { ObjectKind::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition") }
}
