//! Competitions HTTP server.
//!
//! Serves the processor callbacks and the admin API, runs the reconciliation
//! worker and exposes Prometheus metrics on a separate port.

use anyhow::Context;
use competitions::engine::{Engine, EngineSettings};
use competitions::metrics::MetricsServer;
use competitions::server::{AppState, build_router, shutdown_signal};
use competitions::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use ticket_engine_core::environment::SystemClock;
use ticket_engine_gateway::{GatewayConfig, HttpPaymentGateway};
use ticket_engine_postgres::{PoolSettings, PostgresStore};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env().context("Invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting competitions server");
    info!(
        host = %config.server.host,
        port = config.server.port,
        gateway = %config.gateway.base_url,
        reconciliation = config.reconciliation.enabled,
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr = format!("{}:{}", config.server.metrics_host, config.server.metrics_port)
        .parse()
        .context("Invalid metrics address")?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.install()?;

    info!("Connecting to database...");
    let store = PostgresStore::connect(&PoolSettings {
        url: config.postgres.url.clone(),
        max_connections: config.postgres.max_connections,
        min_connections: config.postgres.min_connections,
        acquire_timeout: Duration::from_secs(config.postgres.acquire_timeout),
    })
    .await?;
    if config.postgres.run_migrations {
        store.migrate().await?;
    }
    info!("Database connected");

    let gateway = HttpPaymentGateway::new(
        GatewayConfig::new(config.gateway.api_key.clone())
            .with_base_url(config.gateway.base_url.clone())
            .with_timeout(Duration::from_secs(config.gateway.timeout)),
    )?;

    let engine = Engine::new(
        Arc::new(store),
        Arc::new(gateway),
        Arc::new(SystemClock),
        EngineSettings::from_config(&config),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let metrics_task = tokio::spawn(metrics.serve(shutdown_tx.subscribe()));
    let worker = if config.reconciliation.enabled {
        let engine = engine.clone();
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { engine.run(shutdown).await }))
    } else {
        info!("Reconciliation worker disabled");
        None
    };

    let state = AppState::new(engine, config.server.admin_token.clone());
    if state.admin_token.is_none() {
        warn!("ADMIN_TOKEN not set, admin endpoints are disabled");
    }
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, waiting for background tasks");
    let _ = shutdown_tx.send(());
    let grace = Duration::from_secs(config.server.shutdown_timeout);
    if let Some(worker) = worker {
        if tokio::time::timeout(grace, worker).await.is_err() {
            warn!(timeout_secs = grace.as_secs(), "Reconciliation worker did not stop in time");
        }
    }
    match tokio::time::timeout(grace, metrics_task).await {
        Ok(Ok(Err(err))) => warn!(error = %err, "Metrics server failed"),
        Err(_) => warn!("Metrics server did not stop in time"),
        _ => {}
    }

    info!("Shutdown complete");
    Ok(())
}
