mod api;
mod catalog;
mod config;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use localstate::LocalState;
use crate::catalog::{db::CatalogDb, DevCatalog};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("node_agentd=info,localstate=info"))
        )
        .init();

    tracing::info!("Starting node-agentd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/node-agent/agentd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let state_config = config.agent.to_state_config()?;
    tracing::info!(
        "Agent node '{}' ({}) in {}",
        state_config.node_name,
        state_config.node_id,
        state_config.datacenter
    );

    let db = CatalogDb::open(&config.catalog.db_path)?;
    tracing::info!("Opened catalog at {:?}", config.catalog.db_path);
    let catalog = Arc::new(DevCatalog::new(db, config.catalog.write_tokens.clone()));

    let local = LocalState::new(state_config, catalog);
    local.set_discard_check_output(config.agent.discard_check_output);
    local.load_metadata(config.agent.meta.clone());

    let cancel = CancellationToken::new();

    let ae_cancel = cancel.clone();
    let ae_state = local.clone();
    let ae_handle = tokio::spawn(async move {
        ae_state.anti_entropy(ae_cancel).await;
    });

    let app = api::routes::router(api::routes::AppState { local });

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(ae_handle, server_handle);

    tracing::info!("Shutdown complete");
    Ok(())
}
