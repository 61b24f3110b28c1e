use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod queue;
pub mod registry;
pub mod source;
pub mod store;
pub mod worker;

// Re-export for convenience
pub use config::ServiceConfig;
pub use coordinator::{Coordinator, Disposition};
pub use engine::{EngineError, ExtractionEngine, StaticEngine};
pub use queue::{MemoryQueue, TaskQueue};
pub use registry::Registry;
pub use source::DocumentSource;
pub use store::Store;
pub use worker::{WorkerContext, WorkerPool};

/// Identifier of a document known to the canonical document source.
///
/// New-style e-prints look like `1802.00125`; old-style ones carry a
/// single archive prefix, e.g. `alg-geom/9204001`. Submission
/// identifiers are opaque strings in the same character set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid document identifier: {0}")]
pub struct InvalidDocumentId(String);

impl DocumentId {
    pub fn new(raw: &str) -> Result<Self, InvalidDocumentId> {
        let ok_len = !raw.is_empty() && raw.len() <= 64;
        let ok_chars = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'));
        let ok_shape = raw.matches('/').count() <= 1
            && !raw.starts_with(['.', '/'])
            && !raw.ends_with('/')
            && !raw.contains("..");
        if ok_len && ok_chars && ok_shape {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidDocumentId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = InvalidDocumentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = InvalidDocumentId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<DocumentId> for String {
    fn from(value: DocumentId) -> Self {
        value.0
    }
}

/// The two storage buckets: announced e-prints and pre-announcement
/// submissions. Submissions carry an owner and are access controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Arxiv,
    Submission,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arxiv => "arxiv",
            Self::Submission => "submission",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "arxiv" => Some(Self::Arxiv),
            "submission" => Some(Self::Submission),
            _ => None,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version of the extraction logic that produced (or will produce) an
/// artifact. Totally ordered; artifacts are keyed by it and a newer
/// version supersedes rather than overwrites an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtractorVersion {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid extractor version: {0}")]
pub struct InvalidVersion(String);

impl ExtractorVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidVersion> {
        let bad = || InvalidVersion(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(bad)?;
        Ok(Self {
            major: major.parse().map_err(|_| bad())?,
            minor: minor.parse().map_err(|_| bad())?,
        })
    }
}

impl Default for ExtractorVersion {
    /// Version of the current extraction pipeline.
    fn default() -> Self {
        Self::new(0, 3)
    }
}

impl std::str::FromStr for ExtractorVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ExtractorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl TryFrom<String> for ExtractorVersion {
    type Error = InvalidVersion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ExtractorVersion> for String {
    fn from(value: ExtractorVersion) -> Self {
        value.to_string()
    }
}

/// Lifecycle state of an extraction task.
///
/// `Pending → Running → Completed`, or `Pending/Running → Failed`.
/// Terminal states are never mutated; an explicit re-request with
/// `force` starts a fresh task instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identifier of an extraction task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh id: epoch seconds plus a random suffix, which
    /// keeps ids roughly sortable in logs.
    pub fn generate() -> Self {
        Self(format!("{:x}-{:016x}", epoch_secs(), fastrand::u64(..)))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A durable record of one extraction attempt for one document at one
/// extractor version. Task rows are history: they are created, move
/// through [`TaskState`], and are never deleted.
#[derive(Debug, Clone)]
pub struct ExtractionTask {
    pub id: TaskId,
    pub document_id: DocumentId,
    pub bucket: Bucket,
    pub version: ExtractorVersion,
    pub state: TaskState,
    pub retries: u32,
    /// Reason code for a `Failed` task.
    pub reason: Option<String>,
    /// Idempotency key for event-driven creation; redelivery of the
    /// same event resolves to the same task.
    pub correlation_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Wall-clock seconds since the unix epoch.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
