//! Tether reference resolution.
//!
//! A resource's spec may name values produced by resources it depends on with
//! a whole-string `!{name}` placeholder. The [`SpecProcessor`] builds the
//! name→value table from the resource's references and rewrites the spec tree.

#![forbid(unsafe_code)]

pub mod path;
mod processor;

pub use processor::{Mode, ResolvedDependency, SecretOutput, SpecProcessor};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("reference {0:?} has no example value")]
    NoExample(String),
    #[error("reference name {0:?} is declared more than once")]
    DuplicateReference(String),
    #[error("{0:?} does not name a reference")]
    UnknownReference(String),
    #[error("reference {reference:?}: resource {resource:?} has not been processed")]
    DependencyNotProcessed { reference: String, resource: String },
    #[error("reference {reference:?}: resource {resource:?} has no secret output")]
    NoSecretOutput { reference: String, resource: String },
    #[error("reference {reference:?}: field {path:?} not found")]
    FieldNotFound { reference: String, path: String },
    #[error("reference {reference:?}: value is not valid UTF-8")]
    NotUtf8 { reference: String },
    #[error("reference {reference:?}: unknown modifier {modifier:?}")]
    UnknownModifier { reference: String, modifier: String },
    #[error("{}", join(.0))]
    Multiple(Vec<ResolveError>),
}

fn join(errors: &[ResolveError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl ResolveError {
    /// Pre-validation is skipped, not failed, when a reference has no example.
    pub fn is_no_example(&self) -> bool {
        match self {
            ResolveError::NoExample(_) => true,
            ResolveError::Multiple(all) => !all.is_empty() && all.iter().all(|e| e.is_no_example()),
            _ => false,
        }
    }

    /// Values missing from upstream objects may still appear as they converge.
    pub fn is_retriable(&self) -> bool {
        match self {
            ResolveError::FieldNotFound { .. }
            | ResolveError::NoSecretOutput { .. }
            | ResolveError::DependencyNotProcessed { .. } => true,
            ResolveError::Multiple(all) => all.iter().all(|e| e.is_retriable()),
            _ => false,
        }
    }

    pub(crate) fn collect(mut errors: Vec<ResolveError>) -> Result<(), ResolveError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ResolveError::Multiple(errors)),
        }
    }
}
