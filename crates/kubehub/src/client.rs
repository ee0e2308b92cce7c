//! `ObjectClient` over the kube API with dynamic objects.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DeleteParams, PostParams, Preconditions, PropagationPolicy};
use kube::core::DynamicObject;
use metrics::counter;
use serde_json::Value as Json;
use tether_core::{meta, ClientError, DeleteOptions, ObjectClient, ObjectKind};
use tracing::debug;

use crate::Resolver;

pub struct KubeObjectClient {
    resolver: Arc<Resolver>,
    field_manager: String,
}

impl KubeObjectClient {
    pub fn new(resolver: Arc<Resolver>, field_manager: &str) -> Self {
        Self { resolver, field_manager: field_manager.to_string() }
    }

    fn post_params(&self) -> PostParams {
        PostParams { dry_run: false, field_manager: Some(self.field_manager.clone()) }
    }

    async fn api(&self, kind: &ObjectKind, namespace: &str) -> Result<kube::Api<DynamicObject>, ClientError> {
        self.resolver.api(kind, Some(namespace)).await.map_err(|e| ClientError::Other(format!("{:#}", e)))
    }
}

/// Maps API status codes onto the reconciler's error classes.
pub fn classify(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
            (409, "AlreadyExists") => ClientError::AlreadyExists(ae.message),
            (409, _) => ClientError::Conflict(ae.message),
            (404, _) => ClientError::NotFound(ae.message),
            (400, _) | (422, _) => ClientError::Invalid(ae.message),
            _ => ClientError::Other(format!("{} ({})", ae.message, ae.code)),
        },
        other => ClientError::Other(other.to_string()),
    }
}

fn to_dynamic(obj: &Json) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(obj.clone()).map_err(|e| ClientError::Invalid(format!("not an object document: {}", e)))
}

fn from_dynamic(obj: &DynamicObject) -> Result<Json, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Other(e.to_string()))
}

fn object_name(obj: &Json) -> Result<&str, ClientError> {
    meta::name(obj).ok_or_else(|| ClientError::Invalid("metadata.name is missing".into()))
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn create(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError> {
        let api = self.api(kind, namespace).await?;
        let created = api.create(&self.post_params(), &to_dynamic(obj)?).await.map_err(classify)?;
        counter!("kube_writes_total", 1u64, "verb" => "create");
        from_dynamic(&created)
    }

    async fn update(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError> {
        let api = self.api(kind, namespace).await?;
        let name = object_name(obj)?;
        let replaced = api.replace(name, &self.post_params(), &to_dynamic(obj)?).await.map_err(classify)?;
        counter!("kube_writes_total", 1u64, "verb" => "update");
        from_dynamic(&replaced)
    }

    async fn update_status(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError> {
        let api = self.api(kind, namespace).await?;
        let name = object_name(obj)?;
        let body = serde_json::to_vec(obj).map_err(|e| ClientError::Invalid(e.to_string()))?;
        let replaced = api.replace_status(name, &self.post_params(), body).await.map_err(classify)?;
        counter!("kube_writes_total", 1u64, "verb" => "update_status");
        from_dynamic(&replaced)
    }

    async fn delete(&self, kind: &ObjectKind, namespace: &str, name: &str, opts: &DeleteOptions) -> Result<(), ClientError> {
        let api = self.api(kind, namespace).await?;
        let dp = DeleteParams {
            propagation_policy: Some(if opts.foreground { PropagationPolicy::Foreground } else { PropagationPolicy::Background }),
            preconditions: opts.uid.as_ref().map(|uid| Preconditions { uid: Some(uid.clone()), resource_version: None }),
            ..Default::default()
        };
        api.delete(name, &dp).await.map_err(classify)?;
        counter!("kube_writes_total", 1u64, "verb" => "delete");
        debug!(kind = %kind, namespace, name, "delete requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "boom".into(), reason: reason.into(), code })
    }

    #[test]
    fn classifies_status_codes() {
        assert_eq!(classify(api_err(409, "AlreadyExists")), ClientError::AlreadyExists("boom".into()));
        assert_eq!(classify(api_err(409, "Conflict")), ClientError::Conflict("boom".into()));
        assert_eq!(classify(api_err(404, "NotFound")), ClientError::NotFound("boom".into()));
        assert_eq!(classify(api_err(422, "Invalid")), ClientError::Invalid("boom".into()));
        assert!(classify(api_err(500, "InternalError")).is_retriable());
    }

    #[test]
    fn dynamic_round_trip_keeps_type_and_body() {
        let doc = serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "ns"},
            "data": {"k": "v"}
        });
        let back = from_dynamic(&to_dynamic(&doc).unwrap()).unwrap();
        assert_eq!(back["kind"], "ConfigMap");
        assert_eq!(back["data"]["k"], "v");
        assert_eq!(object_name(&back).unwrap(), "a");
    }
}
