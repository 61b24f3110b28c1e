use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use fulltext_core::auth::{Claims, HttpTokenVerifier, StaticTokenVerifier, TokenVerifier};
use fulltext_core::source::HttpDocumentSource;
use fulltext_core::worker::{WorkerContext, WorkerPool};
use fulltext_core::{Coordinator, ExtractionEngine, MemoryQueue, Registry, ServiceConfig, Store};
use fulltext_extract::SubprocessEngine;
use fulltext_web::{AppState, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("FULLTEXT_CONFIG")
        .ok()
        .map(std::path::PathBuf::from)
        .or_else(ServiceConfig::default_path);
    let config = ServiceConfig::load(config_path.as_deref())?;

    let registry = Arc::new(Registry::open(&config.registry_db)?);
    let store = Arc::new(Store::new(&config.volume)?);
    let queue = Arc::new(MemoryQueue::new(config.lease_visibility));
    let source = Arc::new(HttpDocumentSource::new(
        config.arxiv_base.clone(),
        config.submission_base.clone(),
    ));
    let engine = Arc::new(SubprocessEngine::new(
        config.extractor_binary.clone(),
        config.extractor_version,
    ));
    if !engine.is_available().await {
        tracing::warn!(
            binary = %config.extractor_binary.display(),
            "extractor binary not reachable, tasks will fail until it is"
        );
    }

    let verifier: Arc<dyn TokenVerifier> = match &config.auth_endpoint {
        Some(endpoint) => Arc::new(HttpTokenVerifier::new(endpoint.clone())),
        None => {
            if config.static_tokens.is_empty() {
                tracing::warn!("no auth endpoint and no static tokens, all requests will be 401");
            }
            Arc::new(StaticTokenVerifier::new(parse_static_tokens(
                &config.static_tokens,
            )))
        }
    };

    let coordinator = Arc::new(Coordinator::new(
        registry.clone(),
        store.clone(),
        queue.clone(),
        source.clone(),
        config.extractor_version,
    ));
    let recovered = coordinator.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "requeued tasks left over from a previous run");
    }

    let cancel = CancellationToken::new();
    let sweeper = queue.spawn_sweeper(cancel.clone());
    let pool = WorkerPool::spawn(
        config.workers,
        Arc::new(WorkerContext {
            registry,
            store: store.clone(),
            queue,
            source: source.clone(),
            engine: engine.clone(),
            config: config.worker_config(),
        }),
        cancel.clone(),
    );

    let state = Arc::new(AppState::new(
        coordinator,
        store,
        verifier,
        engine,
        source,
    ));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(bind = %config.bind, "fulltext service listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down workers");
    cancel.cancel();
    pool.shutdown().await;
    sweeper.abort();
    Ok(())
}

/// `token = "subject scope scope..."` entries from the config file.
fn parse_static_tokens(raw: &HashMap<String, String>) -> HashMap<String, Claims> {
    raw.iter()
        .map(|(token, grant)| {
            let mut parts = grant.split_whitespace();
            let subject = parts.next().unwrap_or("anonymous").to_string();
            let scopes = parts.map(str::to_string).collect();
            (
                token.clone(),
                Claims {
                    subject,
                    scopes,
                    delegations: vec![],
                },
            )
        })
        .collect()
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .unwrap_or_else(|e| panic!("failed to install SIGTERM handler: {e}"));
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
