use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use heartline::{
    AppState, build_router, config::Config, rooms::hub::HubHandle, store::SqliteMessageStore,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("heartline=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let store = SqliteMessageStore::connect(&config.database_url, config.max_db_connections)
        .await
        .with_context(|| format!("opening message store at {}", config.database_url))?;

    let bind_address = config.bind_address.clone();
    let state = AppState::start(config, Arc::new(store));
    let hub = state.hub.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!("heartline v{} listening on {}", env!("CARGO_PKG_VERSION"), bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("serving")?;
    Ok(())
}

/// Wait for Ctrl-C, then stop the hub so every live socket gets closed.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
    hub.shutdown().await;
}
