use std::net::SocketAddr;

use axum::http::{header, HeaderName, HeaderValue};
use axum::routing::get;
use axum::Router;
use axum_prometheus::PrometheusMetricLayer;
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use gateway_core::catalog::{CatalogSubscriber, FileCatalog, GrpcCatalogClient};
use gateway_core::registry::ClusterRegistry;
use gateway_core::tls::install_rustls_provider;
use shadow_rs::shadow;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::propagate_header::PropagateHeaderLayer;
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace::{self, TraceLayer};
use tracing::{error, info, warn};

mod errors;
mod logger;
mod routes;

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
#[command(name = "gateway")]
#[command(about = "Serves GraphQL over Kubernetes clusters published to the gateway catalog", long_about = None)]
struct Cli {
    /// Catalog directory to watch, used when `--schema-handler file`.
    #[arg(long, env = "SCHEMAS_DIR", default_value = "/var/lib/gateway/catalog")]
    schemas_dir: String,

    #[arg(long, value_enum, env = "SCHEMA_HANDLER", default_value = "file")]
    schema_handler: SchemaHandler,

    /// Listener gRPC endpoint, used when `--schema-handler grpc`.
    #[arg(long, env = "GRPC_ADDR", default_value = "http://127.0.0.1:50051")]
    grpc_addr: String,

    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Repeatable explicit CORS allow-list; empty means permissive (spec §6).
    #[arg(long = "cors-origin", env = "CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,

    /// JWT claim read for the caller's identity (spec §4.8).
    #[arg(long, env = "USERNAME_CLAIM", default_value = "email")]
    username_claim: String,

    #[arg(long, env = "IMPERSONATE", default_value_t = false)]
    impersonate: bool,

    /// Path segment substituted for `/clusters/{clusterName}` on KCP-style
    /// virtual workspaces; the catalog already routes by cluster name, so
    /// this is accepted for parity with the listener and currently unused.
    #[arg(long, env = "VIRTUAL_WORKSPACE_PREFIX", default_value = "/clusters")]
    virtual_workspace_prefix: String,

    #[arg(long, env = "ALLOW_INSECURE_TLS", default_value_t = false)]
    allow_insecure_tls: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> errors::Result<()> {
    logger::setup("INFO");
    install_rustls_provider();

    let cli = Cli::parse();
    info!(version = APP_VERSION, "starting gateway");
    let _ = &cli.virtual_workspace_prefix;

    let registry = ClusterRegistry::new();
    let token = CancellationToken::new();

    let subscriber_task = {
        let registry = registry.clone();
        let handler = cli.schema_handler;
        let schemas_dir = cli.schemas_dir.clone();
        let grpc_addr = cli.grpc_addr.clone();
        let shutdown = token.clone();
        tokio::spawn(async move {
            if let Err(e) = run_catalog_subscriber(handler, schemas_dir, grpc_addr, registry, shutdown).await {
                error!("catalog subscriber stopped: {e}");
            }
        })
    };

    let state = routes::AppState::new(registry, cli.username_claim.clone(), cli.impersonate, cli.allow_insecure_tls);
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = routes::build_router(state)
        .route("/metrics", get(move || async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().include_headers(true))
                .on_request(trace::DefaultOnRequest::new().level(tracing::Level::DEBUG))
                .on_response(trace::DefaultOnResponse::new().level(tracing::Level::DEBUG)),
        )
        .layer(SetSensitiveHeadersLayer::new(std::iter::once(header::AUTHORIZATION)))
        .layer(CompressionLayer::new())
        .layer(PropagateHeaderLayer::new(HeaderName::from_static("x-request-id")))
        .layer(build_cors(&cli.cors_origins));

    let addr: SocketAddr = cli.http_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway HTTP server listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await?;

    subscriber_task.abort();
    info!("gateway shutdown complete");
    Ok(())
}

/// Feeds the cluster registry from the catalog (spec §4.6): replays the
/// initial snapshot as `Created` events, then applies every live event as it
/// arrives, for as long as the process runs.
async fn run_catalog_subscriber(
    handler: SchemaHandler,
    schemas_dir: String,
    grpc_addr: String,
    registry: ClusterRegistry,
    shutdown: CancellationToken,
) -> errors::Result<()> {
    match handler {
        SchemaHandler::File => {
            let catalog = FileCatalog::new(&schemas_dir)?;
            let mut stream = catalog.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => registry.apply(event),
                        None => break,
                    },
                }
            }
        }
        SchemaHandler::Grpc => {
            let client = GrpcCatalogClient::connect(grpc_addr).await?;
            let mut stream = client.subscribe().await?;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => registry.apply(event),
                        None => break,
                    },
                }
            }
        }
    }
    Ok(())
}

fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
    if parsed.len() != origins.len() {
        warn!("one or more --cors-origin values could not be parsed as header values and were dropped");
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
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
