//! HTTP surface of the fulltext service.
//!
//! Routes follow the bucket split: bare document paths serve announced
//! e-prints, the `/submission` prefix serves access-controlled
//! submissions. `build_router` is separate from the binary so tests
//! can drive the full stack in process.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

pub mod handlers;
pub mod models;
pub mod state;

pub use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(handlers::status::service))
        .route(
            "/submission/{id}",
            get(handlers::retrieve::submission_latest).post(handlers::extract::submission),
        )
        .route(
            "/submission/{id}/status",
            get(handlers::status::submission_task),
        )
        .route(
            "/submission/{id}/format/{format}",
            get(handlers::retrieve::submission_format),
        )
        .route(
            "/{id}",
            get(handlers::retrieve::latest).post(handlers::extract::arxiv),
        )
        .route("/{id}/status", get(handlers::status::task))
        .route("/{id}/format/{format}", get(handlers::retrieve::format))
        .route("/{id}/version/{version}", get(handlers::retrieve::version))
        .route(
            "/{id}/version/{version}/format/{format}",
            get(handlers::retrieve::version_format),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
