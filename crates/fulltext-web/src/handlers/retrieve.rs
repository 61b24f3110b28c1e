//! Artifact retrieval.
//!
//! The bare document route serves the latest committed version; the
//! `version` and `format` segments narrow the request. Responses are
//! `text/plain` unless the client asks for `application/json`, which
//! wraps the content together with its metadata.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use fulltext_core::store::Format;
use fulltext_core::{Bucket, DocumentId, ExtractorVersion};

use super::{authenticate, document_id, submission_owner};
use crate::models::{ApiError, ContentJson};
use crate::state::AppState;

pub async fn latest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve(&state, &headers, &id, Bucket::Arxiv, None, Format::Plain).await
}

pub async fn format(
    State(state): State<Arc<AppState>>,
    Path((id, format)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let format = parse_format(&format)?;
    serve(&state, &headers, &id, Bucket::Arxiv, None, format).await
}

pub async fn version(
    State(state): State<Arc<AppState>>,
    Path((id, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let version = parse_version(&version)?;
    serve(&state, &headers, &id, Bucket::Arxiv, Some(version), Format::Plain).await
}

pub async fn version_format(
    State(state): State<Arc<AppState>>,
    Path((id, version, format)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let version = parse_version(&version)?;
    let format = parse_format(&format)?;
    serve(&state, &headers, &id, Bucket::Arxiv, Some(version), format).await
}

pub async fn submission_latest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve(&state, &headers, &id, Bucket::Submission, None, Format::Plain).await
}

pub async fn submission_format(
    State(state): State<Arc<AppState>>,
    Path((id, format)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let format = parse_format(&format)?;
    serve(&state, &headers, &id, Bucket::Submission, None, format).await
}

fn parse_format(raw: &str) -> Result<Format, ApiError> {
    Format::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("unknown format `{raw}`")))
}

fn parse_version(raw: &str) -> Result<ExtractorVersion, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid version `{raw}`")))
}

async fn serve(
    state: &AppState,
    headers: &HeaderMap,
    raw_id: &str,
    bucket: Bucket,
    version: Option<ExtractorVersion>,
    format: Format,
) -> Result<Response, ApiError> {
    let id = document_id(raw_id)?;
    let claims = authenticate(state, headers).await?;
    let owner = match bucket {
        Bucket::Submission => submission_owner(state, &id).await?,
        Bucket::Arxiv => None,
    };
    fulltext_core::auth::authorize_read(&claims, bucket, owner.as_deref())?;

    let version = match version {
        Some(v) => v,
        None => resolve_latest(state, &id, bucket)?,
    };
    let (meta, content) = state.store.read(&id, bucket, version, format)?;

    let mut response = if wants_json(headers) {
        Json(ContentJson::new(&meta, format.as_str(), content)).into_response()
    } else {
        (StatusCode::OK, content).into_response()
    };
    let h = response.headers_mut();
    if let Ok(etag) = format!("\"{}\"", meta.etag).parse() {
        h.insert(header::ETAG, etag);
    }
    if let Ok(v) = meta.version.to_string().parse() {
        h.insert("x-extractor-version", v);
    }
    Ok(response)
}

fn resolve_latest(
    state: &AppState,
    id: &DocumentId,
    bucket: Bucket,
) -> Result<ExtractorVersion, ApiError> {
    state
        .coordinator
        .resolve_latest(id, bucket)?
        .ok_or(ApiError::NotFound)
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}
