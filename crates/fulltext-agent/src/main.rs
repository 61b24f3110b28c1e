//! Agent that turns announcement events into extraction requests.
//!
//! Tails a JSON-lines event feed, POSTs each document to the fulltext
//! API with the event id as idempotency key, and checkpoints its file
//! offset after every delivered event. Delivery failures stop the
//! batch without advancing the checkpoint; redelivery is harmless
//! because the API deduplicates on the key.

mod checkpoint;
mod events;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use fulltext_core::{Bucket, DocumentId};

use checkpoint::Checkpoint;
use events::{JsonlEventSource, TaskEvent};

struct AgentConfig {
    events_path: PathBuf,
    checkpoint_path: PathBuf,
    api_base: String,
    token: String,
    poll_interval: Duration,
}

impl AgentConfig {
    fn from_env() -> anyhow::Result<Self> {
        let events_path = PathBuf::from(
            std::env::var("FULLTEXT_AGENT_EVENTS")
                .context("FULLTEXT_AGENT_EVENTS must point at the event feed")?,
        );
        let checkpoint_path = std::env::var("FULLTEXT_AGENT_CHECKPOINT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| events_path.with_extension("offset"));
        let api_base = std::env::var("FULLTEXT_API_BASE")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());
        let token =
            std::env::var("FULLTEXT_AGENT_TOKEN").context("FULLTEXT_AGENT_TOKEN is required")?;
        let poll_interval = std::env::var("FULLTEXT_AGENT_POLL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(2));
        Ok(Self {
            events_path,
            checkpoint_path,
            api_base,
            token,
            poll_interval,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_env()?;
    let checkpoint = Checkpoint::new(&config.checkpoint_path);
    let mut source = JsonlEventSource::new(&config.events_path, checkpoint.load()?);
    // A 303 means the artifact already exists; keep it as-is instead
    // of following it into a content fetch.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    tracing::info!(
        events = %config.events_path.display(),
        offset = source.offset(),
        "agent started"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
        let batch = source.poll()?;
        for (event, after) in batch {
            match deliver(&client, &config, &event).await {
                Ok(()) => checkpoint.store(after)?,
                Err(e) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        error = %e,
                        "delivery failed, will retry from checkpoint"
                    );
                    // Rewind to the last delivered event.
                    source = JsonlEventSource::new(&config.events_path, checkpoint.load()?);
                    break;
                }
            }
        }
    }

    tracing::info!(offset = source.offset(), "agent stopped");
    Ok(())
}

/// Forward one event to the API. Client-side rejections are terminal
/// for the event (logged and skipped); transport and server errors
/// bubble up so the batch is retried.
async fn deliver(
    client: &reqwest::Client,
    config: &AgentConfig,
    event: &TaskEvent,
) -> anyhow::Result<()> {
    let id = match DocumentId::new(&event.document_id) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(event_id = %event.event_id, error = %e, "dropping event with bad id");
            return Ok(());
        }
    };
    let bucket = event
        .bucket
        .as_deref()
        .and_then(Bucket::parse)
        .unwrap_or(Bucket::Arxiv);
    let url = match bucket {
        Bucket::Arxiv => format!("{}/{}", config.api_base.trim_end_matches('/'), id),
        Bucket::Submission => format!(
            "{}/submission/{}",
            config.api_base.trim_end_matches('/'),
            id
        ),
    };

    let response = client
        .post(&url)
        .bearer_auth(&config.token)
        .header("x-idempotency-key", &event.event_id)
        .send()
        .await?;
    let status = response.status();
    if status.is_server_error() {
        anyhow::bail!("API returned {status}");
    }
    if status.is_client_error() {
        // 404s for withdrawn papers and the like: terminal, move on.
        tracing::warn!(
            event_id = %event.event_id,
            document_id = %id,
            %status,
            "API rejected event"
        );
    } else {
        tracing::info!(
            event_id = %event.event_id,
            document_id = %id,
            %status,
            "extraction requested"
        );
    }
    Ok(())
}
