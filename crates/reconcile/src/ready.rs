//! Readiness checks. Kinds without a registered checker are always ready.

use std::sync::Arc;

use serde_json::Value as Json;
use tether_core::{meta, well_known, CRD_READY_PATH_ANNOTATION, CRD_READY_VALUE_ANNOTATION};
use tether_resolve::path::{self, Segment};

use crate::registry::KindRegistry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ReadyError {
    pub message: String,
    pub retriable: bool,
}

impl ReadyError {
    pub fn terminal(message: impl Into<String>) -> Self {
        Self { message: message.into(), retriable: false }
    }
}

pub trait ReadyChecker: Send + Sync {
    /// `Ok(false)` means "not yet"; the live object is still converging.
    fn is_ready(&self, live: &Json) -> Result<bool, ReadyError>;
}

pub type ReadyCheckers = KindRegistry<dyn ReadyChecker>;

/// Registry preloaded with the built-in checkers.
pub fn builtin_checkers() -> ReadyCheckers {
    let reg = ReadyCheckers::new();
    reg.register(&well_known::deployment(), Arc::new(DeploymentReady));
    reg.register(&well_known::service(), Arc::new(ServiceReady));
    reg.register(&well_known::service_instance(), Arc::new(CatalogReady { what: "service instance" }));
    reg.register(&well_known::service_binding(), Arc::new(CatalogReady { what: "service binding" }));
    reg
}

fn status_condition<'a>(live: &'a Json, type_: &str) -> Option<&'a Json> {
    live.pointer("/status/conditions")?.as_array()?.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
}

fn condition_is(c: &Json, status: &str) -> bool {
    c.get("status").and_then(|s| s.as_str()) == Some(status)
}

fn int_at(live: &Json, pointer: &str) -> Option<i64> {
    live.pointer(pointer).and_then(|v| v.as_i64())
}

/// The controller has seen the latest spec.
fn generation_observed(live: &Json) -> bool {
    match (int_at(live, "/metadata/generation"), int_at(live, "/status/observedGeneration")) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

pub struct DeploymentReady;

impl ReadyChecker for DeploymentReady {
    fn is_ready(&self, live: &Json) -> Result<bool, ReadyError> {
        if !generation_observed(live) {
            return Ok(false);
        }
        if let Some(c) = status_condition(live, "Progressing") {
            if c.get("reason").and_then(|r| r.as_str()) == Some("ProgressDeadlineExceeded") {
                return Err(ReadyError::terminal("deployment exceeded its progress deadline"));
            }
        }
        let want = int_at(live, "/spec/replicas").unwrap_or(1);
        let updated = int_at(live, "/status/updatedReplicas").unwrap_or(0);
        let available = int_at(live, "/status/availableReplicas").unwrap_or(0);
        let total = int_at(live, "/status/replicas").unwrap_or(0);
        Ok(updated >= want && available >= want && total <= updated)
    }
}

pub struct ServiceReady;

impl ReadyChecker for ServiceReady {
    fn is_ready(&self, live: &Json) -> Result<bool, ReadyError> {
        if live.pointer("/spec/type").and_then(|t| t.as_str()) != Some("LoadBalancer") {
            return Ok(true);
        }
        Ok(live
            .pointer("/status/loadBalancer/ingress")
            .and_then(|i| i.as_array())
            .map_or(false, |i| !i.is_empty()))
    }
}

/// Service catalog objects report `Ready` and `Failed` conditions.
pub struct CatalogReady {
    what: &'static str,
}

impl ReadyChecker for CatalogReady {
    fn is_ready(&self, live: &Json) -> Result<bool, ReadyError> {
        if let Some(failed) = status_condition(live, "Failed").filter(|c| condition_is(c, "True")) {
            let msg = failed.get("message").and_then(|m| m.as_str()).unwrap_or("no message");
            return Err(ReadyError::terminal(format!("{} failed: {}", self.what, msg)));
        }
        let ready = status_condition(live, "Ready").map_or(false, |c| condition_is(c, "True"));
        Ok(ready && generation_observed(live))
    }
}

/// Readiness declared on a discovered CRD: the field at `path` must equal `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationReady {
    path: Vec<Segment>,
    value: String,
}

impl AnnotationReady {
    /// Built from the `ready-path`/`ready-value` annotations of a CRD document.
    /// `None` when the CRD does not declare readiness or the path is malformed.
    pub fn from_crd(crd: &Json) -> Option<Self> {
        let raw_path = meta::annotation(crd, CRD_READY_PATH_ANNOTATION)?;
        let value = meta::annotation(crd, CRD_READY_VALUE_ANNOTATION)?;
        let path = path::parse(raw_path).ok()?;
        Some(Self { path, value: value.to_string() })
    }
}

impl ReadyChecker for AnnotationReady {
    fn is_ready(&self, live: &Json) -> Result<bool, ReadyError> {
        Ok(match path::extract(live, &self.path) {
            Some(Json::String(s)) => *s == self.value,
            Some(Json::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        })
    }
}
