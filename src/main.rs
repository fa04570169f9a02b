use anyhow::{Context, Result};
use std::sync::Arc;
use token_vault::api::{create_admin_router, AdminAppState};
use token_vault::config::{load_config, VaultConfig};
use token_vault::credentials::SqliteTokenStore;
use token_vault::jobs::vault_status;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "token_vault=info".into()),
        )
        .init();

    info!("Token vault starting...");

    // File first, environment on top
    let mut config = match std::env::var("VAULT_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => VaultConfig::default(),
    };
    config.apply_env(std::env::vars());

    info!(
        db_path = %config.storage.db_path,
        bind_addr = %config.admin.bind_addr,
        key_versions = config.keys.versions.len(),
        "Configuration loaded"
    );

    let store = Arc::new(
        SqliteTokenStore::new(&config.storage.db_path)
            .context("Failed to initialize token store")?,
    );

    let state = AdminAppState::from_config(store, &config);
    match vault_status(state.store.as_ref(), state.codec.keys()).await {
        Ok(status) => {
            if status.active_version.is_none() {
                warn!("No active key configured, token writes will fail closed");
            }
            if status.legacy_records > 0 {
                warn!(legacy_records = status.legacy_records, "Plaintext records awaiting migration");
            }
        }
        Err(e) => warn!(error = %e, "Failed to read vault status"),
    }
    if config.admin.internal_secret.is_none() {
        warn!("VAULT_INTERNAL_SECRET not set, admin API rejects every call");
    }

    let router = create_admin_router(state);
    let listener = tokio::net::TcpListener::bind(&config.admin.bind_addr)
        .await
        .context("Failed to bind admin API address")?;
    info!(bind_addr = %config.admin.bind_addr, "Admin API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Admin API server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("Token vault stopped");

    Ok(())
}
