//! Task admission and recovery.
//!
//! The coordinator is the only component that creates tasks. It
//! checks the upstream copy exists, short-circuits when an artifact at
//! the current extractor version is already on disk, and otherwise
//! claims the document in the registry before enqueueing. The claim
//! is the dedup point: concurrent requests for the same document
//! collapse onto one in-flight task.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::queue::TaskQueue;
use crate::registry::{ClaimOutcome, DocumentRecord, Registry, RegistryError};
use crate::source::{DocumentSource, SourceError};
use crate::store::{Store, StoreError};
use crate::{Bucket, DocumentId, ExtractionTask, ExtractorVersion, TaskId, TaskState};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("document not found")]
    NotFound,
    #[error(transparent)]
    Source(SourceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SourceError> for CoordinatorError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::NotFound => CoordinatorError::NotFound,
            other => CoordinatorError::Source(other),
        }
    }
}

/// What happened to an extraction request.
#[derive(Debug)]
pub enum Disposition {
    /// An artifact at the requested version already exists.
    AlreadyExists { version: ExtractorVersion },
    /// Another task for this document is still in flight.
    InProgress { task_id: TaskId },
    /// A new task was created and queued.
    Accepted { task_id: TaskId },
}

pub struct Coordinator {
    registry: Arc<Registry>,
    store: Arc<Store>,
    queue: Arc<dyn TaskQueue>,
    source: Arc<dyn DocumentSource>,
    version: ExtractorVersion,
}

impl Coordinator {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<Store>,
        queue: Arc<dyn TaskQueue>,
        source: Arc<dyn DocumentSource>,
        version: ExtractorVersion,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            source,
            version,
        }
    }

    pub fn extractor_version(&self) -> ExtractorVersion {
        self.version
    }

    /// Admit an extraction request.
    ///
    /// `force` skips the already-exists short-circuit; a fresh task is
    /// still deduplicated against any in-flight one. When
    /// `correlation_id` matches a previously admitted request the
    /// original task is returned unchanged.
    pub async fn request_extraction(
        &self,
        id: &DocumentId,
        bucket: Bucket,
        correlation_id: Option<&str>,
        force: bool,
    ) -> Result<Disposition, CoordinatorError> {
        if !self.source.exists(id, bucket).await? {
            return Err(CoordinatorError::NotFound);
        }

        if !force && self.store.exists(id, bucket, self.version) {
            return Ok(Disposition::AlreadyExists {
                version: self.version,
            });
        }

        match self
            .registry
            .claim(id, bucket, self.version, correlation_id)?
        {
            ClaimOutcome::Claimed(task) => {
                let task_id = task.id.clone();
                if !self.queue.enqueue(task_id.clone()).await {
                    tracing::warn!(task_id = %task_id, "claimed task already queued");
                }
                tracing::info!(
                    task_id = %task_id,
                    document_id = %id,
                    bucket = bucket.as_str(),
                    "extraction task accepted"
                );
                Ok(Disposition::Accepted { task_id })
            }
            ClaimOutcome::InProgress(task_id) => Ok(Disposition::InProgress { task_id }),
            ClaimOutcome::Existing(task) => {
                // Idempotent replay of an earlier request.
                if task.state.is_terminal() {
                    match task.state {
                        TaskState::Completed => Ok(Disposition::AlreadyExists {
                            version: task.version,
                        }),
                        _ => Ok(Disposition::InProgress { task_id: task.id }),
                    }
                } else {
                    Ok(Disposition::InProgress { task_id: task.id })
                }
            }
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Result<Option<ExtractionTask>, RegistryError> {
        self.registry.task(task_id)
    }

    pub fn record(
        &self,
        id: &DocumentId,
        bucket: Bucket,
    ) -> Result<DocumentRecord, RegistryError> {
        self.registry.record(id, bucket)
    }

    /// Best available artifact version for a document, never newer
    /// than the running extractor. Falls back to scanning the store
    /// when the registry has no record, which covers artifacts written
    /// by earlier deployments.
    pub fn resolve_latest(
        &self,
        id: &DocumentId,
        bucket: Bucket,
    ) -> Result<Option<ExtractorVersion>, CoordinatorError> {
        if let Some(v) = self.registry.latest_version(id, bucket)?
            && v <= self.version
        {
            return Ok(Some(v));
        }
        Ok(self.store.latest_on_disk(id, bucket, Some(self.version))?)
    }

    /// Re-enqueue every task left in flight by a previous process.
    /// Called once at startup, before workers begin leasing.
    pub async fn recover(&self) -> Result<usize, RegistryError> {
        let tasks = self.registry.in_flight()?;
        let mut requeued = 0;
        for task in tasks {
            if task.state == TaskState::Running {
                self.registry.mark_pending(&task.id)?;
            }
            if self.queue.enqueue(task.id.clone()).await {
                requeued += 1;
                tracing::info!(task_id = %task.id, document_id = %task.document_id, "recovered in-flight task");
            }
        }
        Ok(requeued)
    }
}
