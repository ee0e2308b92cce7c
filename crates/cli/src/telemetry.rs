//! Log and metrics setup for the controller process.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Controller crates at info, the kube client only when it complains.
pub const DEFAULT_LOG_FILTER: &str = "info,kube=warn,tower=warn,hyper=warn";

const SYNC_LATENCY_BUCKETS_MS: &[f64] = &[5.0, 25.0, 100.0, 250.0, 1000.0, 5000.0, 30000.0];

/// Installs the global subscriber. A filter that does not parse falls back
/// to the default and says so once logging is up.
pub fn init_logging(filter: &str) {
    let (filter, rejected) = match EnvFilter::try_new(filter) {
        Ok(f) => (f, None),
        Err(e) => (EnvFilter::new(DEFAULT_LOG_FILTER), Some(e)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    if let Some(e) = rejected {
        tracing::warn!(error = %e, fallback = DEFAULT_LOG_FILTER, "ignoring log filter");
    }
}

/// Serves Prometheus metrics on `addr`, every series labelled with the
/// controller's field manager.
pub fn serve_metrics(addr: SocketAddr, field_manager: &str) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("controller", field_manager)
        .set_buckets_for_metric(Matcher::Full("bundle_sync_latency_ms".to_string()), SYNC_LATENCY_BUCKETS_MS)
        .context("configuring latency buckets")?
        .install()
        .with_context(|| format!("serving metrics on {}", addr))?;
    describe_metrics();
    info!(%addr, "metrics endpoint up");
    Ok(())
}

fn describe_metrics() {
    describe_counter!("bundle_sync_total", "Bundle passes, by result.");
    describe_histogram!("bundle_sync_latency_ms", Unit::Milliseconds, "Wall time of one Bundle pass.");
    describe_counter!("bundle_condition_true_total", "Bundle conditions that turned True in a written status, by type.");
    describe_counter!("resource_writes_total", "Managed objects created or updated, by op.");
    describe_counter!("kube_writes_total", "Calls made to the API server that change state, by verb.");
    describe_counter!("store_events_total", "Watch deltas applied to the object store.");
    describe_gauge!("store_waiters", "Callers parked on an object condition.");
    describe_gauge!("workqueue_depth", "Bundle keys waiting for a worker.");
    describe_counter!("workqueue_dropped_total", "Bundle keys dropped because the work queue was full.");
}
