//! Property ledger server
//!
//! Opens the sled store, starts the background reconciliation loop and serves
//! the REST API (default 0.0.0.0:11111).
//!
//! Usage:
//!   cargo run --bin ledger-cli -- create-admin --email a@b.io --password ...
//!   cargo run --bin seed_data      # optional sample data
//!   JWT_SECRET=... cargo run --bin property_ledger

use std::sync::Arc;

use tokio::net::TcpListener;

use property_ledger::auth::TokenKeys;
use property_ledger::clock::SystemClock;
use property_ledger::config::Settings;
use property_ledger::logging::init_logging;
use property_ledger::reconcile::spawn_reconciler;
use property_ledger::registry::Registry;
use property_ledger::rest::create_router;
use property_ledger::storage::Storage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = Settings::from_env()?;
    let _log_guard = init_logging(&settings.log_filter, settings.log_format, &settings.log_dir)?;

    let tokens = TokenKeys::new(settings.require_secret()?.as_bytes(), settings.token_ttl_minutes);
    let storage = Storage::open(&settings.database_path)?;
    let registry = Registry::new(storage, Arc::new(SystemClock), settings.policy());
    tracing::info!(
        path = %settings.database_path.display(),
        rest_addr = %settings.rest_addr,
        "property ledger starting"
    );

    let reconciler = settings
        .reconcile_interval()
        .map(|every| spawn_reconciler(registry.clone(), every));
    if reconciler.is_none() {
        tracing::warn!("background reconciliation disabled");
    }

    let app = create_router(registry.clone(), tokens);
    let listener = TcpListener::bind(settings.rest_addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = reconciler {
        handle.abort();
    }
    registry.storage().flush()?;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c; serving until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
