//! The extraction engine seam.
//!
//! The engine is an opaque capability: bytes of a PDF go in (by path),
//! plain text comes out. Concrete implementations live elsewhere (see
//! the `fulltext-extract` crate for the subprocess one); keeping the
//! trait here lets the worker and tests depend on the contract alone.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ExtractorVersion;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("extractor failed: {0}")]
    Failed(String),
    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),
    #[error("extractor produced no output")]
    EmptyOutput,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A text-extraction engine invocable with a bounded timeout.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    /// The extractor version that keys artifacts produced by this engine.
    fn version(&self) -> ExtractorVersion;

    /// Extract plain text from the PDF at `pdf`. Implementations must
    /// respect `timeout` and report [`EngineError::Timeout`] when
    /// exceeded.
    async fn run(&self, pdf: &Path, timeout: Duration) -> Result<String, EngineError>;

    /// Whether the engine's backing tool is reachable. Used by the
    /// health endpoint; defaults to available.
    async fn is_available(&self) -> bool {
        true
    }
}

/// Canned engine for tests and local development: returns a fixed text,
/// optionally failing the first N invocations, and counts every call.
pub struct StaticEngine {
    version: ExtractorVersion,
    output: String,
    invocations: AtomicU32,
    failures_remaining: AtomicU32,
    delay: Mutex<Option<Duration>>,
}

impl StaticEngine {
    pub fn new(version: ExtractorVersion, output: impl Into<String>) -> Self {
        Self {
            version,
            output: output.into(),
            invocations: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(0),
            delay: Mutex::new(None),
        }
    }

    /// Fail the next `n` invocations with [`EngineError::Failed`].
    pub fn fail_next(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside each invocation (to observe `Running`).
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
        self
    }

    /// Total number of `run` calls so far.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionEngine for StaticEngine {
    fn version(&self) -> ExtractorVersion {
        self.version
    }

    async fn run(&self, _pdf: &Path, _timeout: Duration) -> Result<String, EngineError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let took_failure = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if took_failure {
            return Err(EngineError::Failed("injected failure".into()));
        }
        Ok(self.output.clone())
    }
}
