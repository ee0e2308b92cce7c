use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tether_core::{bundle_kind, well_known};
use tether_kubehub::{CrdDiscovery, KubeObjectClient, KubeWatchSource, Resolver, WatchRegistry};
use tether_reconcile::{Config, Controller, Engine, PluginRegistry};
use tether_store::Store;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod check;
mod telemetry;

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether bundle controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict to one namespace (default: all, or TETHER_NAMESPACE)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Log filter directives
    #[arg(long = "log", env = "TETHER_LOG", global = true, default_value = telemetry::DEFAULT_LOG_FILTER)]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run {
        /// Parallel bundle workers
        #[arg(long)]
        workers: Option<usize>,
        /// Full resync period in seconds
        #[arg(long = "resync-secs")]
        resync_secs: Option<u64>,
        /// Serve Prometheus metrics on this host:port
        #[arg(long = "metrics-addr", env = "TETHER_METRICS_ADDR")]
        metrics_addr: Option<SocketAddr>,
    },
    /// Validate a Bundle file offline
    Check {
        /// Path to a Bundle YAML document
        file: String,
    },
    /// Print the order in which a Bundle's resources are processed
    Order {
        /// Path to a Bundle YAML document
        file: String,
    },
}

fn read_bundle(file: &str) -> Result<tether_core::Bundle> {
    let yaml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    check::parse_bundle(&yaml).with_context(|| format!("loading {}", file))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(&cli.log);

    match cli.command {
        Commands::Run { workers, resync_secs, metrics_addr } => {
            let mut config = Config::from_env();
            if let Some(n) = workers.filter(|n| *n > 0) {
                config.workers = n;
            }
            if let Some(secs) = resync_secs {
                config.resync = Duration::from_secs(secs);
            }
            if cli.namespace.is_some() {
                config.namespace = cli.namespace.clone();
            }
            if let Some(addr) = metrics_addr {
                telemetry::serve_metrics(addr, &config.field_manager)?;
            }
            run(config).await?;
        }
        Commands::Check { file } => {
            let bundle = read_bundle(&file)?;
            let report = check::check(&bundle);
            match cli.output {
                Output::Human => {
                    if report.ok() {
                        println!("{}: ok ({} resources)", report.bundle, bundle.spec.resources.len());
                    }
                    for issue in &report.issues {
                        match &issue.resource {
                            Some(r) => println!("{} • {} • {}", report.bundle, r, issue.message),
                            None => println!("{} • {}", report.bundle, issue.message),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if !report.ok() {
                return Err(anyhow!("{} issue(s) found in {}", report.issues.len(), file));
            }
        }
        Commands::Order { file } => {
            let bundle = read_bundle(&file)?;
            let order = tether_reconcile::processing_order(&bundle).map_err(|e| anyhow!(e.message))?;
            match cli.output {
                Output::Human => {
                    for (i, name) in order.iter().enumerate() {
                        println!("{:>3}  {}", i + 1, name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&order)?),
            }
        }
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!(workers = config.workers, resync_secs = config.resync.as_secs(), ns = ?config.namespace, "starting controller");
    let client = kube::Client::try_default().await.context("building kube client")?;
    let resolver = Arc::new(Resolver::new(client));
    let cancel = CancellationToken::new();
    let (store, store_task) = Store::spawn(cancel.clone());

    let objects = Arc::new(KubeObjectClient::new(resolver.clone(), &config.field_manager));
    let engine = Arc::new(Engine::new(store.clone(), objects, PluginRegistry::new()).with_shutdown(cancel.clone()));
    let source = Arc::new(KubeWatchSource::new(resolver.clone(), config.namespace.clone()));
    let registry = Arc::new(WatchRegistry::new(store.clone(), source, config.queue_cap));

    registry.ensure_watch(&bundle_kind()).await.context("watching bundles")?;
    for kind in [
        well_known::secret(),
        well_known::config_map(),
        well_known::service(),
        well_known::service_account(),
        well_known::deployment(),
        well_known::ingress(),
    ] {
        registry.ensure_watch(&kind).await.with_context(|| format!("watching {}", kind))?;
    }
    // The service catalog is optional on a cluster.
    for kind in [well_known::service_instance(), well_known::service_binding()] {
        if let Err(e) = registry.ensure_watch(&kind).await {
            warn!(kind = %kind, error = %e, "kind not available; objects of it cannot be managed");
        }
    }

    let discovery = Arc::new(CrdDiscovery::new(registry.clone(), engine.clone()));
    let discovery_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = discovery.run(cancel).await {
                error!(error = %e, "CRD discovery failed");
            }
        }
    });
    let controller = Arc::new(Controller::new(engine.clone(), config));
    let mut controller_task = tokio::spawn(controller.run(cancel.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => info!("interrupt received; shutting down"),
        res = &mut controller_task => match res {
            Ok(Ok(())) => warn!("controller stopped"),
            Ok(Err(e)) => error!(error = %e, "controller failed"),
            Err(e) => error!(error = %e, "controller task panicked"),
        },
    }

    cancel.cancel();
    registry.shutdown().await;
    if !controller_task.is_finished() {
        if let Err(e) = controller_task.await {
            warn!(error = %e, "controller task");
        }
    }
    if let Err(e) = discovery_task.await {
        warn!(error = %e, "discovery task");
    }
    if let Err(e) = store_task.await {
        warn!(error = %e, "store task");
    }
    info!("stopped");
    Ok(())
}
