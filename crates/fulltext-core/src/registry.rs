//! Durable per-document task and extraction state.
//!
//! The registry is the single source of truth for deduplication and
//! "latest version" resolution, and the single point of mutual
//! exclusion between concurrent requesters: [`Registry::claim`] is an
//! atomic compare-and-set on the per-document `in_progress_task_id`
//! slot, so exactly one task per document can be in flight.
//!
//! Backed by SQLite in WAL mode behind a single writer connection:
//! serialized writes, short transactions, `busy_timeout` instead of
//! retry loops.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::{Bucket, DocumentId, ExtractionTask, ExtractorVersion, TaskId, TaskState, epoch_secs};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no such task: {0}")]
    UnknownTask(TaskId),
    #[error("corrupt registry row: {0}")]
    Corrupt(String),
}

/// Outcome of a claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The slot was free; a fresh `Pending` task now holds it.
    Claimed(ExtractionTask),
    /// Another task already holds the slot; attach to it.
    InProgress(TaskId),
    /// The correlation id was seen before; this is the task it created.
    Existing(ExtractionTask),
}

/// Registry read-out for one document.
#[derive(Debug, Clone, Default)]
pub struct DocumentRecord {
    pub latest_version: Option<ExtractorVersion>,
    pub in_progress: Option<TaskId>,
    /// Most recently created task for the document, if any.
    pub last_task: Option<ExtractionTask>,
}

pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    /// Open (and migrate) the registry database at `path`.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init(conn)
    }

    /// In-memory registry for tests.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS registry (
                 document_id          TEXT NOT NULL,
                 bucket               TEXT NOT NULL,
                 latest_version       TEXT,
                 in_progress_task_id  TEXT,
                 PRIMARY KEY (document_id, bucket)
             );
             CREATE TABLE IF NOT EXISTS tasks (
                 task_id              TEXT PRIMARY KEY,
                 document_id          TEXT NOT NULL,
                 bucket               TEXT NOT NULL,
                 version              TEXT NOT NULL,
                 state                TEXT NOT NULL,
                 retries              INTEGER NOT NULL DEFAULT 0,
                 reason               TEXT,
                 correlation_id       TEXT UNIQUE,
                 created_at           INTEGER NOT NULL,
                 updated_at           INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS tasks_by_document
                 ON tasks (document_id, bucket, created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Atomically claim the in-progress slot for a document.
    ///
    /// The compare-and-set is a single `UPDATE ... WHERE
    /// in_progress_task_id IS NULL`: of any number of concurrent
    /// claimants, exactly one observes a changed row and wins. A
    /// `correlation_id` that was used before short-circuits to the task
    /// it created, which makes event redelivery a no-op.
    pub fn claim(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
        version: ExtractorVersion,
        correlation_id: Option<&str>,
    ) -> Result<ClaimOutcome, RegistryError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;

        if let Some(cid) = correlation_id {
            let existing = tx
                .query_row(
                    "SELECT * FROM tasks WHERE correlation_id = ?1",
                    params![cid],
                    task_from_row,
                )
                .optional()?;
            if let Some(task) = existing {
                tx.commit()?;
                return Ok(ClaimOutcome::Existing(task));
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO registry (document_id, bucket) VALUES (?1, ?2)",
            params![document_id.as_str(), bucket.as_str()],
        )?;

        let task_id = TaskId::generate();
        let changed = tx.execute(
            "UPDATE registry SET in_progress_task_id = ?3
             WHERE document_id = ?1 AND bucket = ?2 AND in_progress_task_id IS NULL",
            params![document_id.as_str(), bucket.as_str(), task_id.as_str()],
        )?;

        if changed == 0 {
            let holder: String = tx.query_row(
                "SELECT in_progress_task_id FROM registry
                 WHERE document_id = ?1 AND bucket = ?2",
                params![document_id.as_str(), bucket.as_str()],
                |row| row.get(0),
            )?;
            tx.commit()?;
            return Ok(ClaimOutcome::InProgress(TaskId::from_string(holder)));
        }

        let now = epoch_secs();
        tx.execute(
            "INSERT INTO tasks (task_id, document_id, bucket, version, state,
                                retries, reason, correlation_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6, ?7, ?7)",
            params![
                task_id.as_str(),
                document_id.as_str(),
                bucket.as_str(),
                version.to_string(),
                TaskState::Pending.as_str(),
                correlation_id,
                now,
            ],
        )?;
        tx.commit()?;

        Ok(ClaimOutcome::Claimed(ExtractionTask {
            id: task_id,
            document_id: document_id.clone(),
            bucket,
            version,
            state: TaskState::Pending,
            retries: 0,
            reason: None,
            correlation_id: correlation_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        }))
    }

    /// Record a successful commit: the task is `Completed`, the claim is
    /// released, and `latest_version` advances. A lower version never
    /// regresses `latest_version` (stale re-claims after a lease timeout
    /// may complete out of order).
    pub fn complete(&self, task_id: &TaskId, version: ExtractorVersion) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let task = tx
            .query_row(
                "SELECT * FROM tasks WHERE task_id = ?1",
                params![task_id.as_str()],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| RegistryError::UnknownTask(task_id.clone()))?;

        tx.execute(
            "UPDATE tasks SET state = ?2, updated_at = ?3 WHERE task_id = ?1",
            params![task_id.as_str(), TaskState::Completed.as_str(), epoch_secs()],
        )?;

        let current: Option<String> = tx.query_row(
            "SELECT latest_version FROM registry WHERE document_id = ?1 AND bucket = ?2",
            params![task.document_id.as_str(), task.bucket.as_str()],
            |row| row.get(0),
        )?;
        let current = current
            .map(|v| ExtractorVersion::parse(&v).map_err(|e| RegistryError::Corrupt(e.to_string())))
            .transpose()?;
        if current.is_none_or(|c| version > c) {
            tx.execute(
                "UPDATE registry SET latest_version = ?3
                 WHERE document_id = ?1 AND bucket = ?2",
                params![
                    task.document_id.as_str(),
                    task.bucket.as_str(),
                    version.to_string()
                ],
            )?;
        }
        tx.execute(
            "UPDATE registry SET in_progress_task_id = NULL
             WHERE document_id = ?1 AND bucket = ?2 AND in_progress_task_id = ?3",
            params![
                task.document_id.as_str(),
                task.bucket.as_str(),
                task_id.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record permanent failure: the task is terminal with a reason, and
    /// the claim is released so a later explicit request can re-claim.
    /// No artifact reference is touched.
    pub fn fail(&self, task_id: &TaskId, reason: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let task = tx
            .query_row(
                "SELECT * FROM tasks WHERE task_id = ?1",
                params![task_id.as_str()],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| RegistryError::UnknownTask(task_id.clone()))?;

        tx.execute(
            "UPDATE tasks SET state = ?2, reason = ?3, updated_at = ?4 WHERE task_id = ?1",
            params![
                task_id.as_str(),
                TaskState::Failed.as_str(),
                reason,
                epoch_secs()
            ],
        )?;
        tx.execute(
            "UPDATE registry SET in_progress_task_id = NULL
             WHERE document_id = ?1 AND bucket = ?2 AND in_progress_task_id = ?3",
            params![
                task.document_id.as_str(),
                task.bucket.as_str(),
                task_id.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn mark_running(&self, task_id: &TaskId) -> Result<(), RegistryError> {
        self.set_state(task_id, TaskState::Running)
    }

    /// Return a task to `Pending` ahead of a retry requeue.
    pub fn mark_pending(&self, task_id: &TaskId) -> Result<(), RegistryError> {
        self.set_state(task_id, TaskState::Pending)
    }

    fn set_state(&self, task_id: &TaskId, state: TaskState) -> Result<(), RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn.execute(
            "UPDATE tasks SET state = ?2, updated_at = ?3 WHERE task_id = ?1",
            params![task_id.as_str(), state.as_str(), epoch_secs()],
        )?;
        if changed == 0 {
            return Err(RegistryError::UnknownTask(task_id.clone()));
        }
        Ok(())
    }

    /// Increment and return the task's retry count.
    pub fn bump_retry(&self, task_id: &TaskId) -> Result<u32, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn.execute(
            "UPDATE tasks SET retries = retries + 1, updated_at = ?2 WHERE task_id = ?1",
            params![task_id.as_str(), epoch_secs()],
        )?;
        if changed == 0 {
            return Err(RegistryError::UnknownTask(task_id.clone()));
        }
        let retries = conn.query_row(
            "SELECT retries FROM tasks WHERE task_id = ?1",
            params![task_id.as_str()],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(retries)
    }

    pub fn task(&self, task_id: &TaskId) -> Result<Option<ExtractionTask>, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(conn
            .query_row(
                "SELECT * FROM tasks WHERE task_id = ?1",
                params![task_id.as_str()],
                task_from_row,
            )
            .optional()?)
    }

    /// Registry read-out plus the most recent task for a document.
    pub fn record(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
    ) -> Result<DocumentRecord, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT latest_version, in_progress_task_id FROM registry
                 WHERE document_id = ?1 AND bucket = ?2",
                params![document_id.as_str(), bucket.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()?;
        let (latest_version, in_progress) = match row {
            Some((latest, holder)) => {
                let latest = latest
                    .map(|v| {
                        ExtractorVersion::parse(&v)
                            .map_err(|e| RegistryError::Corrupt(e.to_string()))
                    })
                    .transpose()?;
                (latest, holder.map(TaskId::from_string))
            }
            None => (None, None),
        };

        let last_task = conn
            .query_row(
                "SELECT * FROM tasks WHERE document_id = ?1 AND bucket = ?2
                 ORDER BY created_at DESC, task_id DESC LIMIT 1",
                params![document_id.as_str(), bucket.as_str()],
                task_from_row,
            )
            .optional()?;

        Ok(DocumentRecord {
            latest_version,
            in_progress,
            last_task,
        })
    }

    pub fn latest_version(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
    ) -> Result<Option<ExtractorVersion>, RegistryError> {
        Ok(self.record(document_id, bucket)?.latest_version)
    }

    /// All non-terminal tasks, for startup recovery.
    pub fn in_flight(&self) -> Result<Vec<ExtractionTask>, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE state IN ('pending', 'running') ORDER BY created_at",
        )?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtractionTask> {
    let invalid =
        |msg: String| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into());

    let document_id: String = row.get("document_id")?;
    let bucket: String = row.get("bucket")?;
    let version: String = row.get("version")?;
    let state: String = row.get("state")?;

    Ok(ExtractionTask {
        id: TaskId::from_string(row.get("task_id")?),
        document_id: DocumentId::new(&document_id).map_err(|e| invalid(e.to_string()))?,
        bucket: Bucket::parse(&bucket)
            .ok_or_else(|| invalid(format!("unknown bucket `{bucket}`")))?,
        version: ExtractorVersion::parse(&version).map_err(|e| invalid(e.to_string()))?,
        state: TaskState::parse(&state)
            .ok_or_else(|| invalid(format!("unknown task state `{state}`")))?,
        retries: row.get("retries")?,
        reason: row.get("reason")?,
        correlation_id: row.get("correlation_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
