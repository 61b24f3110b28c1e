use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use fulltext_core::auth::AuthError;
use fulltext_core::coordinator::CoordinatorError;
use fulltext_core::registry::RegistryError;
use fulltext_core::store::StoreError;
use fulltext_core::{ExtractionTask, store::ArtifactMeta};

// ── Response bodies ─────────────────────────────────────────────────────

/// Body of a 202 Accepted response to an extraction request.
#[derive(Debug, Serialize)]
pub struct AcceptedJson {
    pub reason: &'static str,
    pub task_id: String,
}

impl AcceptedJson {
    pub fn new(task_id: String) -> Self {
        Self {
            reason: "fulltext extraction in process",
            task_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskJson {
    pub task_id: String,
    pub document_id: String,
    pub bucket: String,
    pub version: String,
    pub status: String,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started: u64,
    pub updated: u64,
}

impl From<&ExtractionTask> for TaskJson {
    fn from(t: &ExtractionTask) -> Self {
        Self {
            task_id: t.id.to_string(),
            document_id: t.document_id.to_string(),
            bucket: t.bucket.to_string(),
            version: t.version.to_string(),
            status: t.state.to_string(),
            retries: t.retries,
            reason: t.reason.clone(),
            started: t.created_at,
            updated: t.updated_at,
        }
    }
}

/// JSON rendition of an artifact, returned when the client asks for
/// `application/json` instead of the raw text.
#[derive(Debug, Serialize)]
pub struct ContentJson {
    pub document_id: String,
    pub version: String,
    pub format: String,
    pub etag: String,
    pub created: u64,
    pub content: String,
}

impl ContentJson {
    pub fn new(meta: &ArtifactMeta, format: &str, content: String) -> Self {
        Self {
            document_id: meta.document_id.to_string(),
            version: meta.version.to_string(),
            format: format.to_string(),
            etag: meta.etag.clone(),
            created: meta.created,
            content,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthJson {
    pub store: bool,
    pub extractor: bool,
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    /// Also covers authorization failures on submissions, which are
    /// reported as 404 so probes cannot confirm a submission exists.
    NotFound,
    BadRequest(String),
    Unauthorized,
    Forbidden(&'static str),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> String {
        match self {
            Self::NotFound => "fulltext not found".to_string(),
            Self::BadRequest(r) => r.clone(),
            Self::Unauthorized => "missing or invalid token".to_string(),
            Self::Forbidden(scope) => format!("missing required scope {scope}"),
            Self::Internal(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            tracing::error!(detail = %detail, "request failed");
        }
        let body = serde_json::json!({ "reason": self.reason() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingScope(scope) => Self::Forbidden(scope),
            // Ownership failures are indistinguishable from absence.
            AuthError::NotOwner => Self::NotFound,
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::NotFound => Self::NotFound,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DoesNotExist => Self::NotFound,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self::Internal(e.to_string())
    }
}
