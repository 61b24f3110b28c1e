pub mod extract;
pub mod retrieve;
pub mod status;

use axum::http::{HeaderMap, header};

use fulltext_core::auth::{Claims, VerifyError};
use fulltext_core::source::SourceError;
use fulltext_core::{Bucket, DocumentId};

use crate::models::ApiError;
use crate::state::AppState;

/// Resolve the bearer token on the request into verified claims.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Claims, ApiError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
    match state.verifier.verify(token).await {
        Ok(claims) => Ok(claims),
        Err(VerifyError::InvalidToken) => Err(ApiError::Unauthorized),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// Parse a path segment into a document id. Old-style ids carry a
/// slash and arrive percent-encoded (`alg-geom%2F9204001`); axum has
/// already decoded them by the time they reach us.
pub(crate) fn document_id(raw: &str) -> Result<DocumentId, ApiError> {
    DocumentId::new(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Owner of a submission, for the ownership check. A submission the
/// upstream does not know is a plain 404.
pub(crate) async fn submission_owner(
    state: &AppState,
    id: &DocumentId,
) -> Result<Option<String>, ApiError> {
    match state.owner_lookup.owner(id, Bucket::Submission).await {
        Ok(owner) => Ok(owner),
        Err(SourceError::NotFound) => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}
