use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use db_query_service::api;
use db_query_service::config::Config;
use db_query_service::storage::SqliteStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging; RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Starting server on {}", config.server_address());

    // Initialize SQLite storage
    let storage_path = config.database.url.trim_start_matches("sqlite:").trim_start_matches("//");
    if let Some(parent) = Path::new(storage_path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create storage directory {}", parent.display()))?;
    }
    let storage = Arc::new(SqliteStorage::new(&config.database.url).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        e
    })?);

    // Create router with state
    let app = api::create_router_with_state(storage.clone(), config.clone());

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    storage.close().await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
