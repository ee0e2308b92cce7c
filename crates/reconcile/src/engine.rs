use std::sync::Arc;
use std::time::Duration;

use tether_core::ObjectClient;
use tether_store::Store;
use tokio_util::sync::CancellationToken;

use crate::index::DependentIndex;
use crate::output::{builtin_extractors, OutputExtractors};
use crate::plugin::PluginRegistry;
use crate::postprocess::{builtin_post_processors, PostProcessors};
use crate::ready::{builtin_checkers, ReadyCheckers};
use crate::schema::SchemaRegistry;

/// How long a pass waits for its own write to reach the Store.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a reconciliation pass reads from or writes through.
pub struct Engine {
    pub store: Store,
    pub client: Arc<dyn ObjectClient>,
    pub plugins: PluginRegistry,
    pub ready: ReadyCheckers,
    pub post: PostProcessors,
    pub outputs: OutputExtractors,
    pub schemas: SchemaRegistry,
    /// Objects each Bundle's last pass declared or read.
    pub dependents: DependentIndex,
    pub settle_timeout: Duration,
    /// Aborts in-flight waits on shutdown.
    pub shutdown: CancellationToken,
}

impl Engine {
    /// Engine with the built-in ready checkers, post-processors and output extractors.
    pub fn new(store: Store, client: Arc<dyn ObjectClient>, plugins: PluginRegistry) -> Self {
        Self {
            store,
            client,
            plugins,
            ready: builtin_checkers(),
            post: builtin_post_processors(),
            outputs: builtin_extractors(),
            schemas: SchemaRegistry::new(),
            dependents: DependentIndex::new(),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}
