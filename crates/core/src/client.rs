//! Write seam between the reconciler and the API server.

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::ObjectKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Write raced another writer; the resulting watch event triggers the next pass.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_) | ClientError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_retriable(&self) -> bool {
        !matches!(self, ClientError::Invalid(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Only delete if the live object still has this uid.
    pub uid: Option<String>,
    /// Foreground cascading propagation.
    pub foreground: bool,
}

#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn create(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError>;

    /// Full replace guarded by `metadata.resourceVersion`.
    async fn update(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError>;

    async fn update_status(&self, kind: &ObjectKind, namespace: &str, obj: &Json) -> Result<Json, ClientError>;

    async fn delete(&self, kind: &ObjectKind, namespace: &str, name: &str, opts: &DeleteOptions) -> Result<(), ClientError>;
}
