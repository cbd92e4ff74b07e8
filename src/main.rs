//! kv-connector: connector host for disaggregated prefill/decode serving.
//!
//! Resolves the configured connector, constructs its scheduler and worker
//! halves against a local block pool, and exposes the admin API:
//!   GET /health, GET /v1/connector/stats,
//!   GET /v1/connector/requests/{request_id}, GET /metrics

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::info;

use kv_connector::cache::block::KvBlockPool;
use kv_connector::config::{Cli, Config};
use kv_connector::connector::{ConnectorFactory, ConnectorRegistry, WorkerConnector};
use kv_connector::server::admin_api::{build_router, AdminState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_connector=debug,tower_http=debug"
    } else {
        "kv_connector=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-connector v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let connector_config = Arc::new(config.kv_transfer.clone());

    info!(
        connector = %connector_config.kv_connector,
        engine_id = %connector_config.engine_id,
        runtime = %config.runtime,
        num_layers = connector_config.layout.num_layers,
        block_size = connector_config.layout.block_size,
        "Configuration loaded"
    );

    // Resolve and construct both connector halves.
    let registry = Arc::new(ConnectorRegistry::with_builtins());
    info!(connectors = ?registry.names(), "Connector registry ready");

    let factory = ConnectorFactory::new(registry, config.runtime);
    factory.open_stores(&connector_config).await?;

    let scheduler = factory.create_scheduler(connector_config.clone())?;
    let worker: Arc<dyn WorkerConnector> = Arc::from(factory.create_worker(connector_config.clone())?);

    let pool = Arc::new(KvBlockPool::new(
        connector_config.layout.num_blocks,
        connector_config.layout.num_layers,
    ));
    worker.register_kv_caches(pool)?;

    info!(
        scheduler = scheduler.name(),
        worker = worker.name(),
        "Connector halves ready"
    );

    // Build application state.
    let state = Arc::new(AdminState {
        connector: connector_config.kv_connector.clone(),
        engine_id: connector_config.engine_id.clone(),
        scheduler: Mutex::new(scheduler),
        workers: vec![worker],
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli.listen.unwrap_or(config.admin.listen);
    info!(addr = %listen_addr, "Starting admin server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
