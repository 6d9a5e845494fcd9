//! Pesa Ledger server
//!
//! Serves the ledger API and runs the background queue sweeper.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;

use pesa_ledger::config::{Config, StoreBackend};
use pesa_ledger::payments::{CarrierGateway, DarajaGateway};
use pesa_ledger::state::AppState;
use pesa_ledger::store::{InMemoryLedgerStore, LedgerStore, PgLedgerStore};
use pesa_ledger::sync::QueueSweeper;
use pesa_ledger::ussd::{InMemorySessionStore, SessionStore};
use pesa_ledger::{app, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(
        environment = config.environment.as_str(),
        backend = ?config.store_backend,
        "Starting Pesa Ledger"
    );

    let store: Arc<dyn LedgerStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config)
                .await
                .context("Failed to connect to database")?;
            Arc::new(PgLedgerStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory ledger store; data is lost on restart");
            Arc::new(InMemoryLedgerStore::new())
        }
    };

    let gateway: Option<Arc<dyn CarrierGateway>> = match config.carrier.clone() {
        Some(carrier) => {
            tracing::info!(base_url = %carrier.base_url, short_code = %carrier.short_code, "Carrier gateway configured");
            Some(Arc::new(DarajaGateway::new(carrier)))
        }
        None => {
            tracing::warn!("MPESA credentials not set, collections and disbursements are disabled");
            None
        }
    };

    let app_state = AppState::assemble(
        store,
        gateway,
        config.transaction_threshold,
        config.sync_max_retries,
    );

    let sessions: Arc<dyn SessionStore> =
        Arc::new(InMemorySessionStore::new(config.ussd_session_ttl));
    let sweeper = QueueSweeper::new(
        app_state.sync_engine.clone(),
        sessions,
        config.sync_sweep_interval,
    );
    tokio::spawn(async move {
        tracing::info!("Sync sweeper task started");
        sweeper.run().await;
        tracing::error!("Sync sweeper task exited unexpectedly");
    });

    let router = app(app_state, config.cors_allowed_origins.as_deref());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);
    tracing::info!("Health check at http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
