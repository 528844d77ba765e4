use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, error, info};
use uuid::Uuid;

use physio_store::{CorrectionParams, Job, SampleQuery, StoreError};

use crate::state::app_state::AppState;

#[derive(Deserialize, Debug)]
pub struct UploadRequest {
    pub title: String,
    pub source: String,
    pub files: Vec<PathBuf>,
}

/// Per-dataset shift (seconds) and stretch.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct SyncValues {
    #[serde(default)]
    pub timeshift: f64,
    #[serde(default = "unit_stretch")]
    pub stretch_factor: f64,
}

fn unit_stretch() -> f64 {
    1.0
}

#[derive(Deserialize, Debug)]
pub struct SyncRequest {
    pub reference_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub params: HashMap<Uuid, SyncValues>,
}

#[derive(Serialize, Debug)]
pub struct Accepted {
    pub queued: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// `StoreError` as an HTTP response.
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_conflict() {
            StatusCode::CONFLICT
        } else {
            error!("Request failed: {}", self.0);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs catalog and storage work off the async threads.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> physio_store::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError),
        Err(e) => Err(ApiError(StoreError::Io(std::io::Error::other(e.to_string())))),
    }
}

/// =======================
/// ROUTER
/// =======================

pub fn data_routes(state: AppState) -> Router {
    Router::new()
        .route("/datasets", post(create_dataset))
        .route("/datasets/{id}", get(get_dataset))
        .route("/datasets/{id}/reparse", post(reparse_dataset))
        .route("/datasets/{id}/signals", get(list_signals))
        .route("/signals/{id}", get(get_signal))
        .route("/signals/{id}/samples", get(signal_samples))
        .route("/signals/{id}/correct", post(correct_signal))
        .route("/sync", put(sync_datasets))
        .with_state(state)
}

/// =======================
/// HANDLERS
/// =======================

async fn create_dataset(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> ApiResult<Response> {
    debug!("Upload {} with source {}", request.title, request.source);
    let ingestor = state.ingestor.clone();
    let (dataset, request) = blocking(move || {
        let parser = ingestor.registry().get(&request.source)?;
        parser.validate_files(&request.files)?;
        let dataset = ingestor.storage().database().create_upload(
            &request.title,
            &request.source,
            &request.files,
        )?;
        Ok((dataset, request))
    })
    .await?;

    // the upload is committed at this point
    state.jobs.enqueue(Job::Ingest {
        dataset_id: dataset.id,
        source: request.source,
        files: request.files,
    })?;
    info!("Dataset {} queued for ingestion", dataset.id);
    Ok((StatusCode::ACCEPTED, Json(dataset)).into_response())
}

async fn get_dataset(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let storage = state.storage.clone();
    let dataset = blocking(move || storage.database().get_dataset(id)).await?;
    Ok(Json(dataset).into_response())
}

async fn reparse_dataset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let storage = state.storage.clone();
    blocking(move || {
        let dataset = storage.database().get_dataset(id)?;
        dataset.status.reset()?;
        Ok(())
    })
    .await?;
    state.jobs.enqueue(Job::Reingest { dataset_id: id })?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { queued: 1 })).into_response())
}

async fn list_signals(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let storage = state.storage.clone();
    let signals = blocking(move || {
        storage.database().get_dataset(id)?;
        storage.database().list_signals(id)
    })
    .await?;
    Ok(Json(signals).into_response())
}

async fn get_signal(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let storage = state.storage.clone();
    let signal = blocking(move || storage.database().get_signal(id)).await?;
    Ok(Json(signal).into_response())
}

async fn signal_samples(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SampleQuery>,
) -> ApiResult<Response> {
    let storage = state.storage.clone();
    let payload = blocking(move || storage.samples(id, &query)).await?;
    Ok(Json(payload).into_response())
}

async fn correct_signal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(params): Json<CorrectionParams>,
) -> ApiResult<Response> {
    // reject bad parameters now rather than in the worker
    params.transform(0)?;
    let storage = state.storage.clone();
    blocking(move || storage.database().get_signal(id)).await?;
    state.jobs.enqueue(Job::CorrectSignal {
        signal_id: id,
        params,
    })?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { queued: 1 })).into_response())
}

async fn sync_datasets(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Response> {
    let reference_time = request
        .reference_time
        .ok_or_else(|| StoreError::config("Reference time is missing"))?;
    if request.params.is_empty() {
        return Err(StoreError::config("No synchronization parameters given").into());
    }

    let mut jobs = Vec::with_capacity(request.params.len());
    for (dataset_id, values) in &request.params {
        let params = CorrectionParams {
            timeshift: values.timeshift,
            stretch_factor: values.stretch_factor,
            reference_time: Some(reference_time),
        };
        params.transform(0)?;
        jobs.push(Job::CorrectDataset {
            dataset_id: *dataset_id,
            params,
        });
    }

    let storage = state.storage.clone();
    let ids: Vec<Uuid> = request.params.keys().copied().collect();
    blocking(move || {
        for id in ids {
            storage.database().get_dataset(id)?;
        }
        Ok(())
    })
    .await?;

    let queued = jobs.len();
    for job in jobs {
        state.jobs.enqueue(job)?;
    }
    info!("Queued synchronization of {} datasets", queued);
    Ok((StatusCode::ACCEPTED, Json(Accepted { queued })).into_response())
}
