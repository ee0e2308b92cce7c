//! Tether reconciliation engine.
//!
//! A [`BundleSyncTask`] runs one pass over a Bundle: it orders the declared
//! resources by their references, runs a [`ResourceSyncTask`] for each in
//! that order, garbage-collects objects the Bundle no longer declares and
//! writes the aggregated status back. The [`Controller`] drives passes from
//! store events on a bounded worker pool with at most one pass per Bundle in
//! flight.

#![forbid(unsafe_code)]

pub mod bundle;
pub mod compare;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod gc;
pub mod index;
pub mod output;
pub mod plugin;
pub mod postprocess;
pub mod queue;
pub mod ready;
pub mod registry;
pub mod resource;
pub mod schema;
pub mod status;

pub use bundle::{processing_order, BundleSyncTask, SyncOutcome};
pub use config::Config;
pub use controller::Controller;
pub use engine::Engine;
pub use error::{BundleError, Conflict, Reason, ResourceError};
pub use index::{DependentIndex, ObjectRef};
pub use plugin::{Plugin, PluginContext, PluginDescription, PluginError, PluginRegistry};
pub use queue::WorkQueue;
pub use ready::{ReadyChecker, ReadyError};
pub use resource::{ResourceInfo, ResourceState, ResourceSyncTask};
