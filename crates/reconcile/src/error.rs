use std::fmt;

use tether_core::{ClientError, ResourceName};

/// Machine-readable cause attached to Error conditions and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    InvalidSpec,
    ValidationFailed,
    NoSuchPlugin,
    PluginFailed,
    ResolveFailed,
    StoreUnavailable,
    BeingDeleted,
    NotOwned,
    PostProcessFailed,
    WriteFailed,
    SpecMismatch,
    NotReady,
    OutputFailed,
    DuplicateName,
    InvalidGraph,
    DeleteFailed,
    StatusWriteFailed,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::InvalidSpec => "InvalidSpec",
            Reason::ValidationFailed => "ValidationFailed",
            Reason::NoSuchPlugin => "NoSuchPlugin",
            Reason::PluginFailed => "PluginFailed",
            Reason::ResolveFailed => "ResolveFailed",
            Reason::StoreUnavailable => "StoreUnavailable",
            Reason::BeingDeleted => "BeingDeleted",
            Reason::NotOwned => "NotOwned",
            Reason::PostProcessFailed => "PostProcessFailed",
            Reason::WriteFailed => "WriteFailed",
            Reason::SpecMismatch => "SpecMismatch",
            Reason::NotReady => "NotReady",
            Reason::OutputFailed => "OutputFailed",
            Reason::DuplicateName => "DuplicateName",
            Reason::InvalidGraph => "InvalidGraph",
            Reason::DeleteFailed => "DeleteFailed",
            Reason::StatusWriteFailed => "StatusWriteFailed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one resource within a pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct ResourceError {
    pub reason: Reason,
    pub message: String,
    pub retriable: bool,
}

impl ResourceError {
    pub fn terminal(reason: Reason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into(), retriable: false }
    }

    pub fn retriable(reason: Reason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into(), retriable: true }
    }

    pub fn from_client(reason: Reason, err: &ClientError) -> Self {
        Self { reason, message: err.to_string(), retriable: err.is_retriable() }
    }
}

/// Failure at the bundle level: invalid graph, deletion or GC problems.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct BundleError {
    pub reason: Reason,
    pub message: String,
    pub retriable: bool,
}

impl BundleError {
    pub fn terminal(reason: Reason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into(), retriable: false }
    }

    pub fn retriable(reason: Reason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into(), retriable: true }
    }
}

/// A write raced another writer. The pass stops; the watch event the other
/// write produced schedules the next one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("write conflict on {resource}: {message}")]
pub struct Conflict {
    pub resource: ResourceName,
    pub message: String,
}
