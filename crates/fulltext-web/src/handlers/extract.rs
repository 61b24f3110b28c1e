//! Extraction triggers.
//!
//! POST on a document admits an extraction request. The interesting
//! part is what comes back: 202 with the task location while work is
//! pending (whether this request created it or an earlier one did),
//! 303 redirecting to the content when the artifact already exists.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use fulltext_core::{Bucket, Disposition};

use super::{authenticate, document_id, submission_owner};
use crate::models::{AcceptedJson, ApiError};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ExtractQuery {
    /// Re-extract even when an artifact at the current version exists.
    #[serde(default)]
    pub force: bool,
}

pub async fn arxiv(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ExtractQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    trigger(&state, &headers, &id, Bucket::Arxiv, query).await
}

pub async fn submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ExtractQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    trigger(&state, &headers, &id, Bucket::Submission, query).await
}

async fn trigger(
    state: &AppState,
    headers: &HeaderMap,
    raw_id: &str,
    bucket: Bucket,
    query: ExtractQuery,
) -> Result<Response, ApiError> {
    let id = document_id(raw_id)?;
    let claims = authenticate(state, headers).await?;
    let owner = match bucket {
        Bucket::Submission => submission_owner(state, &id).await?,
        Bucket::Arxiv => None,
    };
    fulltext_core::auth::authorize_trigger(&claims, bucket, owner.as_deref())?;

    // Clients that retry (or event redeliveries routed through the
    // API) pass an idempotency key; replays resolve to the same task.
    let correlation = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok());

    let base = match bucket {
        Bucket::Arxiv => format!("/{id}"),
        Bucket::Submission => format!("/submission/{id}"),
    };
    let disposition = state
        .coordinator
        .request_extraction(&id, bucket, correlation, query.force)
        .await?;
    let response = match disposition {
        Disposition::Accepted { task_id } | Disposition::InProgress { task_id } => (
            StatusCode::ACCEPTED,
            [(header::LOCATION, format!("{base}/status"))],
            Json(AcceptedJson::new(task_id.to_string())),
        )
            .into_response(),
        Disposition::AlreadyExists { version } => (
            StatusCode::SEE_OTHER,
            [(header::LOCATION, format!("{base}/version/{version}"))],
        )
            .into_response(),
    };
    Ok(response)
}
