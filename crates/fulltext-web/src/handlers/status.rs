//! Health and task-status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use fulltext_core::Bucket;

use super::{authenticate, document_id, submission_owner};
use crate::models::{ApiError, HealthJson, TaskJson};
use crate::state::AppState;

/// Service health: 200 when the volume and the extractor backend are
/// both reachable, 503 otherwise.
pub async fn service(State(state): State<Arc<AppState>>) -> Response {
    let health = HealthJson {
        store: state.store.is_available(),
        extractor: state.engine.is_available().await,
    };
    let code = if health.store && health.extractor {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health)).into_response()
}

pub async fn task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    document_task(&state, &headers, &id, Bucket::Arxiv).await
}

pub async fn submission_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    document_task(&state, &headers, &id, Bucket::Submission).await
}

/// Status of the most recent extraction task for a document.
async fn document_task(
    state: &AppState,
    headers: &HeaderMap,
    raw_id: &str,
    bucket: Bucket,
) -> Result<Response, ApiError> {
    let id = document_id(raw_id)?;
    let claims = authenticate(state, headers).await?;
    let owner = match bucket {
        Bucket::Submission => submission_owner(state, &id).await?,
        Bucket::Arxiv => None,
    };
    fulltext_core::auth::authorize_read(&claims, bucket, owner.as_deref())?;

    let record = state.coordinator.record(&id, bucket)?;
    let task = record.last_task.ok_or(ApiError::NotFound)?;
    Ok(Json(TaskJson::from(&task)).into_response())
}
