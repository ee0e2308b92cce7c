//! Plugin interface. A plugin turns a free-form spec plus the outputs of the
//! resources it references into one concrete object.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value as Json};
use tether_core::{ObjectKind, ResourceName};
use tether_resolve::ResolvedDependency;

#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescription {
    pub name: String,
    /// Kind of the object `process` produces.
    pub kind: ObjectKind,
    /// JSON schema for the plugin's spec map, checked during pre-validation.
    pub spec_schema: Option<Json>,
}

pub struct PluginContext<'a> {
    pub namespace: &'a str,
    /// Live object previously produced for this resource, if any.
    pub actual: Option<&'a Json>,
    pub dependencies: &'a BTreeMap<ResourceName, ResolvedDependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
    pub message: String,
    pub retriable: bool,
}

impl PluginError {
    pub fn terminal(message: impl Into<String>) -> Self {
        Self { message: message.into(), retriable: false }
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retriable: true }
    }
}

pub trait Plugin: Send + Sync {
    fn describe(&self) -> PluginDescription;

    fn validate_spec(&self, _spec: &Map<String, Json>) -> Result<(), PluginError> {
        Ok(())
    }

    fn process(&self, spec: &Map<String, Json>, ctx: &PluginContext<'_>) -> Result<Json, PluginError>;
}

/// Plugins by name. Built once at startup and shared read-only.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: FxHashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.describe().name;
        self.plugins.insert(name, plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }
}
