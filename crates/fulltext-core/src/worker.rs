//! Extraction workers.
//!
//! Each worker leases one task at a time, pulls the PDF from the
//! upstream source, runs the extraction engine, cleans and validates
//! the text, and commits both renditions to the store. Failures are
//! retried with jittered exponential backoff until the retry budget
//! runs out, at which point the task is marked failed and released.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fulltext_text::{average_word_length, fixunicode, psv};

use crate::engine::{EngineError, ExtractionEngine};
use crate::queue::{Lease, TaskQueue};
use crate::registry::Registry;
use crate::source::{DocumentSource, SourceError};
use crate::store::Store;
use crate::ExtractionTask;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hard cap on a single engine invocation.
    pub engine_timeout: Duration,
    /// Retries after the first attempt, so a task runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// How long a lease poll blocks before re-checking for shutdown.
    pub lease_wait: Duration,
    /// Extractions averaging longer words than this are garbage
    /// (binary mis-decoded as text) and are rejected.
    pub max_avg_word_length: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            engine_timeout: Duration::from_secs(600),
            max_retries: 2,
            backoff_base: Duration::from_secs(2),
            lease_wait: Duration::from_millis(500),
            max_avg_word_length: 45.0,
        }
    }
}

pub struct WorkerContext {
    pub registry: Arc<Registry>,
    pub store: Arc<Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub source: Arc<dyn DocumentSource>,
    pub engine: Arc<dyn ExtractionEngine>,
    pub config: WorkerConfig,
}

struct TaskFailure {
    retryable: bool,
    reason: String,
}

impl TaskFailure {
    fn retryable(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
        }
    }

    fn fatal(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
        }
    }
}

impl From<EngineError> for TaskFailure {
    fn from(e: EngineError) -> Self {
        // Every engine failure mode (crash, non-zero exit, timeout,
        // empty output) gets the retry budget before the task fails.
        TaskFailure::retryable(e.to_string())
    }
}

impl From<SourceError> for TaskFailure {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::NotFound => TaskFailure::fatal("source document disappeared"),
            _ => TaskFailure::retryable(e.to_string()),
        }
    }
}

pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(count: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) -> Self {
        let handles = (0..count)
            .map(|n| {
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(n, ctx, cancel).await;
                })
            })
            .collect();
        Self { cancel, handles }
    }

    /// Stop leasing new tasks and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker exited abnormally");
            }
        }
    }
}

async fn worker_loop(worker: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    tracing::debug!(worker, "worker started");
    loop {
        let lease = tokio::select! {
            _ = cancel.cancelled() => break,
            lease = ctx.queue.lease_next(ctx.config.lease_wait) => lease,
        };
        let Some(lease) = lease else { continue };
        handle_lease(worker, &ctx, lease).await;
    }
    tracing::debug!(worker, "worker stopped");
}

async fn handle_lease(worker: usize, ctx: &WorkerContext, lease: Lease) {
    let task = match ctx.registry.task(&lease.task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            tracing::warn!(task_id = %lease.task_id, "leased task missing from registry");
            ctx.queue.ack(lease).await;
            return;
        }
        Err(e) => {
            tracing::error!(task_id = %lease.task_id, error = %e, "registry read failed");
            ctx.queue.nack_requeue(lease).await;
            return;
        }
    };
    // A stale lease can resurface a task another worker already
    // finished. Drop it without rerunning anything.
    if task.state.is_terminal() {
        ctx.queue.ack(lease).await;
        return;
    }

    if let Err(e) = ctx.registry.mark_running(&task.id) {
        tracing::error!(task_id = %task.id, error = %e, "failed to mark task running");
        ctx.queue.nack_requeue(lease).await;
        return;
    }

    match process(ctx, &task).await {
        Ok(()) => {
            tracing::info!(
                worker,
                task_id = %task.id,
                document_id = %task.document_id,
                "extraction completed"
            );
            ctx.queue.ack(lease).await;
        }
        Err(failure) => handle_failure(ctx, &task, failure, lease).await,
    }
}

async fn process(ctx: &WorkerContext, task: &ExtractionTask) -> Result<(), TaskFailure> {
    let workdir = tempfile::tempdir()
        .map_err(|e| TaskFailure::retryable(format!("workdir creation failed: {e}")))?;
    let pdf = workdir.path().join("input.pdf");

    ctx.source
        .fetch(&task.document_id, task.bucket, &pdf)
        .await?;

    // The engine is told its deadline, but the worker enforces it too
    // so a misbehaving implementation cannot wedge the loop.
    let raw = match tokio::time::timeout(
        ctx.config.engine_timeout,
        ctx.engine.run(&pdf, ctx.config.engine_timeout),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(EngineError::Timeout(ctx.config.engine_timeout).into()),
    };

    let plain = fixunicode(&raw);
    if plain.trim().is_empty() {
        return Err(TaskFailure::retryable("extraction produced no text"));
    }
    let (_, _, avg) = average_word_length(&plain);
    if avg > ctx.config.max_avg_word_length {
        return Err(TaskFailure::fatal(format!(
            "average word length {avg:.1} exceeds threshold, output looks corrupt"
        )));
    }

    let psv = psv::normalize(&plain);

    ctx.store
        .write(&task.document_id, task.bucket, task.version, &plain, &psv)
        .map_err(|e| TaskFailure::retryable(format!("store write failed: {e}")))?;
    ctx.registry
        .complete(&task.id, task.version)
        .map_err(|e| TaskFailure::retryable(format!("registry completion failed: {e}")))?;
    Ok(())
}

async fn handle_failure(ctx: &WorkerContext, task: &ExtractionTask, failure: TaskFailure, lease: Lease) {
    if failure.retryable {
        let retries = match ctx.registry.bump_retry(&task.id) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "retry bookkeeping failed");
                ctx.queue.nack_requeue(lease).await;
                return;
            }
        };
        if retries <= ctx.config.max_retries {
            tracing::warn!(
                task_id = %task.id,
                document_id = %task.document_id,
                retries,
                reason = %failure.reason,
                "extraction failed, retrying"
            );
            if let Err(e) = ctx.registry.mark_pending(&task.id) {
                tracing::error!(task_id = %task.id, error = %e, "failed to reset task state");
            }
            tokio::time::sleep(backoff(ctx.config.backoff_base, retries)).await;
            ctx.queue.nack_requeue(lease).await;
            return;
        }
    }
    tracing::error!(
        task_id = %task.id,
        document_id = %task.document_id,
        reason = %failure.reason,
        "extraction failed permanently"
    );
    if let Err(e) = ctx.registry.fail(&task.id, &failure.reason) {
        tracing::error!(task_id = %task.id, error = %e, "failed to record task failure");
    }
    ctx.queue.ack(lease).await;
}

/// Exponential backoff with ±50% jitter so retries of simultaneous
/// failures fan out instead of thundering back together.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(8));
    let jitter = 0.5 + fastrand::f64();
    exp.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StaticEngine;
    use crate::queue::MemoryQueue;
    use crate::source::FsDocumentSource;
    use crate::{Bucket, DocumentId, TaskState};

    fn id(s: &str) -> DocumentId {
        s.parse().unwrap()
    }

    struct Fixture {
        ctx: Arc<WorkerContext>,
        engine: Arc<StaticEngine>,
        _dir: tempfile::TempDir,
    }

    fn fixture(engine: StaticEngine) -> Fixture {
        fixture_with(
            engine,
            WorkerConfig {
                backoff_base: Duration::from_millis(1),
                lease_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        )
    }

    fn fixture_with(engine: StaticEngine, config: WorkerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("source/arxiv")).unwrap();
        std::fs::write(dir.path().join("source/arxiv/1234.5678.pdf"), b"%PDF").unwrap();

        let engine = Arc::new(engine);
        let ctx = Arc::new(WorkerContext {
            registry: Arc::new(Registry::open_in_memory().unwrap()),
            store: Arc::new(Store::new(&dir.path().join("volume")).unwrap()),
            queue: Arc::new(MemoryQueue::new(Duration::from_secs(30))),
            source: Arc::new(FsDocumentSource::new(dir.path().join("source"))),
            engine: engine.clone(),
            config,
        });
        Fixture {
            ctx,
            engine,
            _dir: dir,
        }
    }

    async fn claim_and_enqueue(f: &Fixture, doc: &DocumentId) -> crate::TaskId {
        let outcome = f
            .ctx
            .registry
            .claim(doc, Bucket::Arxiv, f.ctx.engine.version(), None)
            .unwrap();
        let crate::registry::ClaimOutcome::Claimed(task) = outcome else {
            panic!("expected fresh claim");
        };
        assert!(f.ctx.queue.enqueue(task.id.clone()).await);
        task.id
    }

    async fn drain_one(f: &Fixture) {
        let lease = f
            .ctx
            .queue
            .lease_next(Duration::from_millis(100))
            .await
            .unwrap_or_else(|| panic!("queue empty"));
        handle_lease(0, &f.ctx, lease).await;
    }

    #[tokio::test]
    async fn successful_extraction_commits_both_renditions() {
        let f = fixture(StaticEngine::new(
            "0.3".parse().unwrap(),
            "The quick brown fox jumps over the lazy dog. It was seen once.",
        ));
        let doc = id("1234.5678");
        let task_id = claim_and_enqueue(&f, &doc).await;
        drain_one(&f).await;

        let task = f.ctx.registry.task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Completed);
        let (_, plain) = f
            .ctx
            .store
            .read(
                &doc,
                Bucket::Arxiv,
                "0.3".parse().unwrap(),
                crate::store::Format::Plain,
            )
            .unwrap();
        assert!(plain.contains("quick brown fox"));
        let (_, psv) = f
            .ctx
            .store
            .read(
                &doc,
                Bucket::Arxiv,
                "0.3".parse().unwrap(),
                crate::store::Format::Psv,
            )
            .unwrap();
        assert!(!psv.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let engine = StaticEngine::new("0.3".parse().unwrap(), "Recovered text after a retry here.")
            .fail_next(1);
        let f = fixture(engine);
        let doc = id("1234.5678");
        let task_id = claim_and_enqueue(&f, &doc).await;

        drain_one(&f).await; // fails, requeues
        drain_one(&f).await; // succeeds

        let task = f.ctx.registry.task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.retries, 1);
        assert_eq!(f.engine.invocations(), 2);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_the_task() {
        let engine = StaticEngine::new("0.3".parse().unwrap(), "never seen").fail_next(10);
        let f = fixture(engine);
        let doc = id("1234.5678");
        let task_id = claim_and_enqueue(&f, &doc).await;

        for _ in 0..3 {
            drain_one(&f).await;
        }

        let task = f.ctx.registry.task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.reason.is_some());
        // Failure releases the claim, a new request can go through.
        assert!(matches!(
            f.ctx
                .registry
                .claim(&doc, Bucket::Arxiv, "0.3".parse().unwrap(), None)
                .unwrap(),
            crate::registry::ClaimOutcome::Claimed(_)
        ));
        // Queue is drained: nothing left to lease.
        assert!(
            f.ctx
                .queue
                .lease_next(Duration::from_millis(20))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn empty_output_is_retried_until_the_budget_runs_out() {
        // Whitespace-only extraction counts as an engine failure and
        // gets the full retry budget rather than failing outright.
        let f = fixture(StaticEngine::new("0.3".parse().unwrap(), "  \n\t  "));
        let doc = id("1234.5678");
        let task_id = claim_and_enqueue(&f, &doc).await;

        for _ in 0..3 {
            drain_one(&f).await;
        }

        let task = f.ctx.registry.task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(f.engine.invocations(), f.ctx.config.max_retries + 1);
        assert!(
            f.ctx
                .queue
                .lease_next(Duration::from_millis(20))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn hung_engine_is_cut_off_at_the_deadline() {
        // The engine ignores the timeout it is handed; the worker must
        // bound the run itself instead of blocking the loop forever.
        let engine = StaticEngine::new("0.3".parse().unwrap(), "never returned")
            .with_delay(Duration::from_secs(60));
        let f = fixture_with(
            engine,
            WorkerConfig {
                engine_timeout: Duration::from_millis(100),
                backoff_base: Duration::from_millis(1),
                lease_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        );
        let doc = id("1234.5678");
        let task_id = claim_and_enqueue(&f, &doc).await;

        tokio::time::timeout(Duration::from_secs(5), drain_one(&f))
            .await
            .expect("worker did not bound the engine run");

        let task = f.ctx.registry.task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retries, 1);
        // The timeout is retryable: the task is back in the queue.
        assert!(
            f.ctx
                .queue
                .lease_next(Duration::from_millis(100))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn garbage_output_is_rejected_without_retry() {
        // One unbroken 120-character "word": average word length far
        // beyond anything prose produces.
        let f = fixture(StaticEngine::new("0.3".parse().unwrap(), "a".repeat(120)));
        let doc = id("1234.5678");
        let task_id = claim_and_enqueue(&f, &doc).await;
        drain_one(&f).await;

        let task = f.ctx.registry.task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.retries, 0);
        assert_eq!(f.engine.invocations(), 1);
    }

    #[tokio::test]
    async fn pool_shuts_down_cleanly() {
        let f = fixture(StaticEngine::new("0.3".parse().unwrap(), "Fine text output here."));
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(2, f.ctx.clone(), cancel.clone());

        let doc = id("1234.5678");
        let task_id = claim_and_enqueue(&f, &doc).await;
        // Give the workers a moment to pick it up.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let task = f.ctx.registry.task(&task_id).unwrap().unwrap();
            if task.state == TaskState::Completed {
                break;
            }
        }
        pool.shutdown().await;

        let task = f.ctx.registry.task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }
}
