use axum::Router;
use std::sync::Arc;
use tracing::{info, warn};

mod models;
mod routes;
mod state;
mod utils;

use crate::state::app_state::AppState;
use crate::utils::conf_helper::{bind, load_config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // === CONFIG + LISTENER ===
    let mut config = load_config(&path).await?;

    tracing_subscriber::fmt()
        .with_max_level(config.level())
        .init();

    let listener = bind(&mut config).await?;

    info!(
        "Server initialized on {}:{}",
        config.connection.ip,
        config.connection.port
    );

    let state = AppState::new(config)?;
    {
        let state = state.clone();
        tokio::task::spawn_blocking(move || state.resume_interrupted()).await??;
    }

    let app = Router::new()
        .merge(routes::info_routes::health_routes(state.clone()))
        .merge(routes::data_routes::data_routes(state.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // drain queued jobs before exiting
    let AppState { jobs, .. } = state;
    match Arc::try_unwrap(jobs) {
        Ok(jobs) => jobs.shutdown().await,
        Err(_) => warn!("Job queue still shared at shutdown, pending jobs dropped"),
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
