use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use gateway_core::access::{AccessEvent, ClusterAccessStore, StaticAccessStore};
use gateway_core::catalog::{CatalogStore, FileCatalog, GrpcCatalogServer, GrpcCatalogService};
use gateway_core::errors::is_transient;
use gateway_core::tls::install_rustls_provider;
use gateway_proto::schema_catalog_server::SchemaCatalogServer;
use shadow_rs::shadow;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod errors;
mod logger;
mod reconciler;

shadow!(build);

pub const APP_VERSION: &str = shadow_rs::formatcp!(
    "{} ({} {}), build_env: {}, {}, {}",
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL,
    build::CARGO_VERSION
);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchemaHandler {
    File,
    Grpc,
}

#[derive(Parser)]
#[command(name = "listener")]
#[command(about = "Discovers Kubernetes API schemas and publishes them to the gateway catalog", long_about = None)]
struct Cli {
    /// Directory of per-cluster ClusterAccess JSON files (C1 default back-end).
    #[arg(long, env = "ACCESS_DIR", default_value = "/etc/gateway/access")]
    access_dir: String,

    #[arg(long, env = "SCHEMAS_DIR", default_value = "/var/lib/gateway/catalog")]
    schemas_dir: String,

    #[arg(long, value_enum, env = "SCHEMA_HANDLER", default_value = "file")]
    schema_handler: SchemaHandler,

    #[arg(long, env = "GRPC_ADDR", default_value = "127.0.0.1:50051")]
    grpc_addr: String,

    /// Path segment substituted for `/clusters/{clusterName}` on KCP-style
    /// virtual workspaces; unused against a standard API server.
    #[arg(long, env = "VIRTUAL_WORKSPACE_PREFIX", default_value = "/clusters")]
    virtual_workspace_prefix: String,

    /// Inherited from the teacher's kube bootstrap wiring; not consumed by
    /// `StaticAccessStore`, kept for a future CRD-backed access store that
    /// needs a home-cluster client.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    #[arg(long, env = "KUBE_CONTEXT")]
    kube_context: Option<String>,

    #[arg(long, env = "ALLOW_INSECURE_TLS", default_value_t = false)]
    allow_insecure_tls: bool,

    /// Fallback full re-reconcile interval, standing in for the live
    /// in-cluster CRD/APIBinding watch (spec §4.4's second trigger).
    #[arg(long, env = "RECONCILE_INTERVAL_SECONDS", default_value_t = 300)]
    reconcile_interval_seconds: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> errors::Result<()> {
    logger::setup("INFO");
    install_rustls_provider();

    let cli = Cli::parse();
    info!(version = APP_VERSION, "starting listener");
    if cli.kubeconfig.is_some() || cli.kube_context.is_some() {
        info!("kubeconfig/kube-context flags accepted but unused by the static access store");
    }
    let _ = &cli.virtual_workspace_prefix;

    let access_store: Arc<dyn ClusterAccessStore> = Arc::new(StaticAccessStore::new(&cli.access_dir)?);

    let token = CancellationToken::new();
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    let catalog: Arc<dyn CatalogStore> = match cli.schema_handler {
        SchemaHandler::File => Arc::new(FileCatalog::new(&cli.schemas_dir)?),
        SchemaHandler::Grpc => {
            let grpc_server = Arc::new(GrpcCatalogServer::new());
            let addr: SocketAddr = cli.grpc_addr.parse()?;
            let shutdown = token.clone();
            let service_server = grpc_server.clone();
            tasks.push(tokio::spawn(async move {
                info!(%addr, "serving catalog over gRPC");
                let service = SchemaCatalogServer::new(GrpcCatalogService::new(service_server));
                if let Err(e) = tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_shutdown(addr, shutdown.cancelled())
                    .await
                {
                    error!("gRPC catalog server failed: {e}");
                }
            }));
            grpc_server
        }
    };

    {
        let access_store = access_store.clone();
        let catalog = catalog.clone();
        let allow_insecure = cli.allow_insecure_tls;
        let shutdown = token.clone();
        let interval = Duration::from_secs(cli.reconcile_interval_seconds);
        tasks.push(tokio::spawn(async move {
            reconcile_loop(access_store, catalog, allow_insecure, interval, shutdown).await;
        }));
    }

    shutdown_signal(token.clone()).await;
    for task in tasks {
        let _ = task.await;
    }
    info!("listener shutdown complete");
    Ok(())
}

/// Reconciles on every cluster add/update/delete event from the access store
/// (spec §4.4's first trigger), for as long as the process runs, while also
/// re-reconciling every known cluster on a fixed interval as a stand-in for
/// the live in-cluster CRD/APIBinding-churn trigger (spec §4.4's second
/// trigger). Both run concurrently so a cluster added after startup is
/// picked up immediately rather than waiting for the next tick.
async fn reconcile_loop(
    access_store: Arc<dyn ClusterAccessStore>,
    catalog: Arc<dyn CatalogStore>,
    allow_insecure: bool,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut known: HashMap<String, (String, gateway_core::types::ClusterAccess)> = HashMap::new();
    let mut events = access_store.watch();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => match event {
                Some(event) => handle_event(event, &catalog, allow_insecure, &mut known).await,
                None => break,
            },
            _ = ticker.tick() => {
                for (cluster_name, (key, access)) in known.clone() {
                    reconcile_with_backoff(&cluster_name, &key, &access, allow_insecure, catalog.as_ref()).await;
                }
            }
        }
    }
}

async fn handle_event(
    event: AccessEvent,
    catalog: &Arc<dyn CatalogStore>,
    allow_insecure: bool,
    known: &mut HashMap<String, (String, gateway_core::types::ClusterAccess)>,
) {
    match event {
        AccessEvent::Added(name, access) | AccessEvent::Updated(name, access) => {
            let key = reconciler::catalog_key_for(&name, &access);
            reconcile_with_backoff(&name, &key, &access, allow_insecure, catalog.as_ref()).await;
            known.insert(name, (key, access));
        }
        AccessEvent::Deleted(name) => {
            if let Some((key, _)) = known.remove(&name) {
                if let Err(e) = catalog.delete(&key).await {
                    error!("{name}: failed to remove catalog entry {key}: {e}");
                } else {
                    info!("{name}: removed catalog entry {key}");
                }
            }
        }
    }
}

/// Retries a transient reconcile failure with exponential backoff; a
/// permanent failure is logged once and not retried until the next event
/// (spec §4.4 "Failure semantics").
async fn reconcile_with_backoff(
    cluster_name: &str,
    key: &str,
    access: &gateway_core::types::ClusterAccess,
    allow_insecure: bool,
    catalog: &dyn CatalogStore,
) {
    let mut delay = Duration::from_secs(1);
    const MAX_ATTEMPTS: u32 = 6;
    for attempt in 1..=MAX_ATTEMPTS {
        match reconciler::reconcile(key, access, allow_insecure, catalog).await {
            Ok(()) => return,
            Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                warn!("{cluster_name}: transient reconcile failure (attempt {attempt}/{MAX_ATTEMPTS}), retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(60));
            }
            Err(e) => {
                error!("{cluster_name}: reconcile failed, giving up until next event: {e}");
                return;
            }
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install signal handler: {err}");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => token.cancel(),
        _ = terminate => token.cancel(),
    }

    println!("signal received, starting graceful shutdown");
}
