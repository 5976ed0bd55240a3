//! bloomd: real-time catalog gateway for the flower storefront.
//!
//! WebSocket gateway + connection registry + liveness supervisor, backed
//! by a Postgres (or in-memory) flower catalog.

mod catalog;
mod clock;
mod config;
mod db;
mod error;
mod fanout;
mod gateway;
mod liveness;
mod registry;
mod routes;
mod state;
mod types;
mod ws;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{Catalog, MemoryCatalog};
use crate::clock::{Clock, SystemClock};
use crate::config::CatalogBackend;
use crate::db::PgCatalog;

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = config::Config::from_env();

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("bloomd starting");
    info!(
        listen = %config.listen_addr,
        instance = %config.server_instance,
        backend = ?config.catalog_backend,
        sweep_secs = config.liveness_sweep.as_secs(),
        stale_secs = config.stale_threshold.as_secs(),
    );

    // ── Catalog ─────────────────────────────────────────────
    let catalog: Arc<dyn Catalog> = match config.catalog_backend {
        CatalogBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .connect(&config.database_url)
                .await
                .expect("failed to connect to Postgres");
            let catalog = PgCatalog::new(pool);
            catalog.migrate().await;
            if let Err(e) = catalog.seed_if_empty().await {
                warn!("seeding skipped: {e}");
            }
            info!("database ready");
            Arc::new(catalog)
        }
        CatalogBackend::Memory => {
            warn!("using in-memory catalog; changes are lost on restart");
            Arc::new(MemoryCatalog::seeded())
        }
    };

    // ── Shared state ────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let state = state::AppState::new(catalog, Arc::clone(&clock), config.clone());

    // ── Background tasks ────────────────────────────────────
    let shutdown = CancellationToken::new();
    let supervisor = liveness::spawn_liveness_supervisor(
        Arc::clone(state.gateway.registry()),
        clock,
        config.liveness_policy(),
        shutdown.clone(),
    );

    // ── Bind & serve ────────────────────────────────────────
    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "bloomd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .expect("server error");

    // Stop the sweep before the registry goes away.
    shutdown.cancel();
    if let Err(e) = supervisor.await {
        warn!("liveness supervisor join error: {e}");
    }
    info!("bloomd stopped");
}

/// Resolves on Ctrl-C or SIGTERM, cancelling `token` so background tasks
/// stop alongside the server.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler error: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler error: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    token.cancel();
}
