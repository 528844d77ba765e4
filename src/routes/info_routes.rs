use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, warn};

use physio_store::StoreConfig;

use crate::state::app_state::AppState;

pub fn health_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(info_check))
        .with_state(state)
}

#[derive(Serialize)]
pub struct ServiceInfo {
    name: String,
    version: String,
    sources: Vec<String>,
    store: StoreConfig,
}

pub async fn info_check(State(state): State<AppState>) -> Response {
    debug!("{} requested", state.config.name);
    Json(ServiceInfo {
        name: state.config.name.clone(),
        version: state.config.version.clone(),
        sources: state.ingestor.registry().keys(),
        store: state.config.store.clone(),
    })
    .into_response()
}

static HEALTH_FAIL_COUNT: AtomicUsize = AtomicUsize::new(0);
const HEALTH_FAIL_LIMIT: usize = 3;

async fn health_check(State(state): State<AppState>) -> Response {
    let storage = state.storage.clone();
    let outcome = tokio::task::spawn_blocking(move || storage.database().ping()).await;
    let is_healthy = matches!(outcome, Ok(Ok(())));

    if is_healthy {
        HEALTH_FAIL_COUNT.store(0, Ordering::Relaxed);

        Json(HealthStatus {
            status: "ok".to_owned(),
        })
        .into_response()
    } else {
        let fails = HEALTH_FAIL_COUNT.fetch_add(1, Ordering::Relaxed) + 1;

        error!("Health check failed ({}/{})", fails, HEALTH_FAIL_LIMIT);
        if fails >= HEALTH_FAIL_LIMIT {
            warn!("Catalog unreachable for {} consecutive checks", fails);
        }

        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "unavailable".to_owned(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
pub struct HealthStatus {
    status: String,
}
