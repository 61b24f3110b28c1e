//! Full-stack API tests: router, auth, coordinator, workers, and
//! store, all in process with a canned engine.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use fulltext_core::auth::{Claims, StaticTokenVerifier};
use fulltext_core::source::FsDocumentSource;
use fulltext_core::worker::{WorkerConfig, WorkerContext, WorkerPool};
use fulltext_core::{Coordinator, MemoryQueue, Registry, StaticEngine, Store};
use fulltext_web::{AppState, build_router};

const SAMPLE_TEXT: &str = "We measure the spectrum of the source. \
The flux is consistent with previous observations of the field.";

struct App {
    router: Router,
    pool: WorkerPool,
    _dir: tempfile::TempDir,
}

fn claims(subject: &str, scopes: &[&str]) -> Claims {
    Claims {
        subject: subject.to_string(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        delegations: vec![],
    }
}

async fn app() -> App {
    app_with_engine(StaticEngine::new("0.3".parse().unwrap(), SAMPLE_TEXT)).await
}

async fn app_with_engine(engine: StaticEngine) -> App {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("source/arxiv")).unwrap();
    std::fs::create_dir_all(dir.path().join("source/submission")).unwrap();
    std::fs::write(dir.path().join("source/arxiv/1802.00125.pdf"), b"%PDF").unwrap();
    std::fs::write(dir.path().join("source/submission/90210.pdf"), b"%PDF").unwrap();
    std::fs::write(dir.path().join("source/submission/90210.owner"), "owner1").unwrap();

    let registry = Arc::new(Registry::open_in_memory().unwrap());
    let store = Arc::new(Store::new(&dir.path().join("volume")).unwrap());
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let source = Arc::new(FsDocumentSource::new(dir.path().join("source")));
    let engine = Arc::new(engine);

    let verifier = StaticTokenVerifier::default()
        .insert("tok-reader", claims("reader", &["fulltext:read"]))
        .insert(
            "tok-creator",
            claims("creator", &["fulltext:read", "fulltext:create"]),
        )
        .insert(
            "tok-owner",
            claims("owner1", &["fulltext:read", "fulltext:create"]),
        )
        .insert(
            "tok-admin",
            claims("root", &["fulltext:read", "fulltext:create", "fulltext:admin"]),
        );

    let coordinator = Arc::new(Coordinator::new(
        registry.clone(),
        store.clone(),
        queue.clone(),
        source.clone(),
        "0.3".parse().unwrap(),
    ));
    let pool = WorkerPool::spawn(
        2,
        Arc::new(WorkerContext {
            registry,
            store: store.clone(),
            queue,
            source: source.clone(),
            engine: engine.clone(),
            config: WorkerConfig {
                backoff_base: Duration::from_millis(1),
                lease_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        }),
        CancellationToken::new(),
    );

    let state = Arc::new(AppState::new(
        coordinator,
        store,
        Arc::new(verifier),
        engine,
        source,
    ));
    App {
        router: build_router(state),
        pool,
        _dir: dir,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

fn get(path: &str, token: &str) -> Request<Body> {
    Request::get(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn post(path: &str, token: &str) -> Request<Body> {
    Request::post(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

/// Poll the status endpoint until the task reaches a terminal state.
async fn wait_for_completion(router: &Router, path: &str, token: &str) {
    for _ in 0..200 {
        let (status, _, body) = send(router, get(path, token)).await;
        if status == StatusCode::OK {
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            match json["status"].as_str() {
                Some("completed") => return,
                Some("failed") => panic!("task failed: {body}"),
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task never completed");
}

#[tokio::test]
async fn extract_then_retrieve() {
    let app = app().await;

    // Nothing there yet.
    let (status, _, _) = send(&app.router, get("/1802.00125", "tok-reader")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Trigger extraction.
    let (status, headers, body) = send(&app.router, post("/1802.00125", "tok-creator")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        headers.get(header::LOCATION).unwrap(),
        "/1802.00125/status"
    );
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["reason"], "fulltext extraction in process");

    wait_for_completion(&app.router, "/1802.00125/status", "tok-reader").await;

    // Plain text by default, with the version and etag surfaced.
    let (status, headers, body) = send(&app.router, get("/1802.00125", "tok-reader")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("spectrum of the source"));
    assert_eq!(headers.get("x-extractor-version").unwrap(), "0.3");
    assert!(headers.get(header::ETAG).is_some());

    // JSON when asked for.
    let request = Request::get("/1802.00125")
        .header(header::AUTHORIZATION, "Bearer tok-reader")
        .header(header::ACCEPT, "application/json")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["version"], "0.3");
    assert!(json["content"].as_str().unwrap().contains("spectrum"));

    // The sentence rendition has no newlines.
    let (status, _, psv) = send(&app.router, get("/1802.00125/format/psv", "tok-reader")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!psv.contains('\n'));

    // Explicit version addressing.
    let (status, _, _) = send(&app.router, get("/1802.00125/version/0.3", "tok-reader")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app.router, get("/1802.00125/version/0.2", "tok-reader")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Re-posting redirects to the extracted content.
    let (status, headers, _) = send(&app.router, post("/1802.00125", "tok-creator")).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        headers.get(header::LOCATION).unwrap(),
        "/1802.00125/version/0.3"
    );

    app.pool.shutdown().await;
}

#[tokio::test]
async fn auth_is_enforced() {
    let app = app().await;

    // No token at all.
    let request = Request::get("/1802.00125").body(Body::empty()).unwrap();
    let (status, _, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Unknown token.
    let (status, _, _) = send(&app.router, get("/1802.00125", "tok-bogus")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Read scope does not allow triggering extractions.
    let (status, _, _) = send(&app.router, post("/1802.00125", "tok-reader")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    app.pool.shutdown().await;
}

#[tokio::test]
async fn submission_ownership() {
    let app = app().await;

    // The owner can trigger and read.
    let (status, _, _) = send(&app.router, post("/submission/90210", "tok-owner")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_completion(&app.router, "/submission/90210/status", "tok-owner").await;
    let (status, _, body) = send(&app.router, get("/submission/90210", "tok-owner")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("spectrum"));

    // A non-owner with full scopes sees a 404, not a 403: the response
    // must not confirm that the submission exists.
    let (status, _, _) = send(&app.router, get("/submission/90210", "tok-creator")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = send(&app.router, post("/submission/90210", "tok-creator")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Admins bypass ownership.
    let (status, _, _) = send(&app.router, get("/submission/90210", "tok-admin")).await;
    assert_eq!(status, StatusCode::OK);

    // Submission artifacts are invisible on the e-print routes.
    let (status, _, _) = send(&app.router, get("/90210", "tok-reader")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.pool.shutdown().await;
}

#[tokio::test]
async fn idempotency_key_replays_same_task() {
    // Slow the engine down so the first task is still in flight when
    // the replay arrives.
    let app = app_with_engine(
        StaticEngine::new("0.3".parse().unwrap(), SAMPLE_TEXT)
            .with_delay(Duration::from_millis(500)),
    )
    .await;

    let request = |token: &str| {
        Request::post("/1802.00125")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header("x-idempotency-key", "evt-001")
            .body(Body::empty())
            .unwrap()
    };
    let (status, _, body) = send(&app.router, request("tok-creator")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let first: serde_json::Value = serde_json::from_str(&body).unwrap();

    let (status, _, body) = send(&app.router, request("tok-creator")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let second: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(first["task_id"], second["task_id"]);

    app.pool.shutdown().await;
}

#[tokio::test]
async fn health_endpoint_is_public() {
    let app = app().await;
    let request = Request::get("/status").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["store"], true);
    assert_eq!(json["extractor"], true);
    app.pool.shutdown().await;
}
