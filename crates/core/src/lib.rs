//! Tether core types: the Bundle model, object kinds, owner references and
//! the dependency graph shared by the store, resolver and reconciler.

#![forbid(unsafe_code)]

pub mod bundle;
pub mod client;
pub mod graph;
pub mod kind;
pub mod meta;

pub use bundle::*;
pub use client::{ClientError, DeleteOptions, ObjectClient};
pub use graph::{Graph, GraphError};
pub use kind::{well_known, ObjectKind};

pub const API_GROUP: &str = "tether.dev";
pub const API_VERSION: &str = "v1";
pub const BUNDLE_KIND: &str = "Bundle";
pub const BUNDLE_PLURAL: &str = "bundles";

/// Finalizer held on a Bundle until its controlled objects are cleaned up.
pub const BUNDLE_FINALIZER: &str = "tether.dev/delete-resources";
/// Finalizer the API server adds while foreground cascading deletion runs.
pub const FOREGROUND_DELETION_FINALIZER: &str = "foregroundDeletion";

pub const BUNDLE_NAME_LABEL: &str = "tether.dev/bundle";
pub const DELETION_DELAY_ANNOTATION: &str = "tether.dev/deletion-delay";
pub const ORPHANED_AT_ANNOTATION: &str = "tether.dev/orphaned-at";
pub const ENV_HASH_ANNOTATION: &str = "tether.dev/env-hash";
pub const PARAMETERS_CHECKSUM_ANNOTATION: &str = "tether.dev/parameters-checksum";

pub const CRD_WATCH_ANNOTATION: &str = "tether.dev/watch";
pub const CRD_READY_PATH_ANNOTATION: &str = "tether.dev/ready-path";
pub const CRD_READY_VALUE_ANNOTATION: &str = "tether.dev/ready-value";

/// Reference modifier selecting the upstream's captured secret output.
pub const MODIFIER_SECRET_OUTPUT: &str = "secretOutput";

pub fn bundle_kind() -> ObjectKind {
    ObjectKind::new(API_GROUP, API_VERSION, BUNDLE_KIND)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid kind: {0}")]
    InvalidKind(String),
    #[error("invalid object: {0}")]
    InvalidObject(String),
}

pub mod prelude {
    pub use super::{
        bundle_kind, meta, Bundle, BundleSpec, BundleStatus, ClientError, Condition, ConditionStatus, ConditionType,
        DeleteOptions, Graph, GraphError, ObjectClient, ObjectKind, Reference, Resource, ResourceName, ResourceSpec,
    };
}
