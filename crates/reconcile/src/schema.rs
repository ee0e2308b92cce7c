//! JSON schemas used to pre-validate evaluated objects before their
//! dependencies are ready.

use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use serde_json::Value as Json;
use tether_core::ObjectKind;

use crate::registry::KindRegistry;

pub fn compile(schema: &Json) -> Result<JSONSchema, String> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| format!("compiling schema: {}", e))
}

/// Human-readable violations, empty when `instance` is valid.
pub fn violations(schema: &JSONSchema, instance: &Json) -> Vec<String> {
    match schema.validate(instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                let at = e.instance_path.to_string();
                if at.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", at, e)
                }
            })
            .collect(),
    }
}

/// Compiled schemas by kind, fed by CRD discovery.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: KindRegistry<JSONSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: &ObjectKind, schema: &Json) -> Result<(), String> {
        let compiled = compile(schema)?;
        self.schemas.register(kind, Arc::new(compiled));
        Ok(())
    }

    pub fn remove(&self, kind: &ObjectKind) {
        self.schemas.remove(kind);
    }

    /// Kinds without a schema pass.
    pub fn validate(&self, kind: &ObjectKind, instance: &Json) -> Vec<String> {
        match self.schemas.get(kind) {
            Some(schema) => violations(&schema, instance),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validates_registered_kinds_only() {
        let reg = SchemaRegistry::new();
        let kind = ObjectKind::new("example.com", "v1", "Widget");
        reg.register(
            &kind,
            &json!({"type": "object", "properties": {"spec": {"type": "object", "required": ["size"],
                "properties": {"size": {"type": "integer"}}}}}),
        )
        .unwrap();
        assert!(reg.validate(&kind, &json!({"spec": {"size": 3}})).is_empty());
        let errs = reg.validate(&kind, &json!({"spec": {"size": "big"}}));
        assert_eq!(errs.len(), 1);
        assert!(errs[0].starts_with("/spec/size"), "{errs:?}");
        assert!(reg.validate(&ObjectKind::new("", "v1", "ConfigMap"), &json!(42)).is_empty());
    }
}
