//! Auxiliary outputs captured from Ready resources and offered to dependents
//! through the `secretOutput` reference modifier.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value as Json;
use tether_core::{meta, well_known};
use tether_resolve::SecretOutput;
use tether_store::Store;

use crate::error::{Reason, ResourceError};
use crate::registry::KindRegistry;

#[async_trait]
pub trait OutputExtractor: Send + Sync {
    async fn extract(&self, live: &Json, store: &Store) -> Result<SecretOutput, ResourceError>;
}

pub type OutputExtractors = KindRegistry<dyn OutputExtractor>;

pub fn builtin_extractors() -> OutputExtractors {
    let reg = OutputExtractors::new();
    reg.register(&well_known::service_binding(), Arc::new(BindingSecret));
    reg
}

/// Decodes the base64 `data` of a Secret document.
pub fn secret_data(secret: &Json) -> Result<SecretOutput, String> {
    let mut out = SecretOutput::new();
    let Some(data) = secret.get("data").and_then(|d| d.as_object()) else { return Ok(out) };
    for (k, v) in data {
        let encoded = v.as_str().ok_or_else(|| format!("data[{}] is not a string", k))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| format!("data[{}]: {}", k, e))?;
        out.insert(k.clone(), bytes);
    }
    Ok(out)
}

/// A ServiceBinding's credentials live in the Secret named by `spec.secretName`
/// (the binding's own name when unset).
pub struct BindingSecret;

#[async_trait]
impl OutputExtractor for BindingSecret {
    async fn extract(&self, live: &Json, store: &Store) -> Result<SecretOutput, ResourceError> {
        let namespace = meta::namespace(live).unwrap_or("default");
        let name = live
            .pointer("/spec/secretName")
            .and_then(|s| s.as_str())
            .or_else(|| meta::name(live))
            .ok_or_else(|| ResourceError::terminal(Reason::OutputFailed, "service binding has no name"))?;
        let secret = store
            .get(&well_known::secret(), namespace, name)
            .await
            .map_err(|e| ResourceError::retriable(Reason::StoreUnavailable, e.to_string()))?
            .ok_or_else(|| ResourceError::retriable(Reason::OutputFailed, format!("binding secret {}/{} not found", namespace, name)))?;
        secret_data(&secret).map_err(|e| ResourceError::terminal(Reason::OutputFailed, format!("secret {}: {}", name, e)))
    }
}
