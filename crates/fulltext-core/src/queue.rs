//! The task-queue capability: enqueue, lease with a visibility timeout,
//! ack, nack-with-requeue. Any broker can stand behind this trait; the
//! in-process [`MemoryQueue`] is the default, with durability provided
//! by the registry (see [`Coordinator::recover`]).
//!
//! [`Coordinator::recover`]: crate::coordinator::Coordinator::recover

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::TaskId;

/// Time-bounded ownership of one queued task by one worker. Dropping a
/// lease without ack/nack lets the visibility timeout reclaim the task.
#[derive(Debug)]
pub struct Lease {
    pub task_id: TaskId,
    token: u64,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a task to the queue. Returns `false` when the task is
    /// already queued or leased (enqueue is idempotent).
    async fn enqueue(&self, task_id: TaskId) -> bool;

    /// Wait up to `wait` for a task; the returned lease is invisible to
    /// other workers until acked, nacked, or expired.
    async fn lease_next(&self, wait: Duration) -> Option<Lease>;

    /// Remove a finished task.
    async fn ack(&self, lease: Lease);

    /// Return a task to the queue for another attempt, preserving its
    /// identity.
    async fn nack_requeue(&self, lease: Lease);
}

struct LeasedTask {
    task_id: TaskId,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    /// Everything owned by the queue: ids currently in the channel or
    /// leased. Guards against duplicate enqueue.
    members: HashSet<TaskId>,
    leased: HashMap<u64, LeasedTask>,
}

/// In-process queue: an unbounded channel feeds workers; leased tasks
/// are parked in a side table until acked or their deadline passes.
pub struct MemoryQueue {
    visibility: Duration,
    tx: async_channel::Sender<TaskId>,
    rx: async_channel::Receiver<TaskId>,
    state: Mutex<QueueState>,
    next_token: AtomicU64,
}

impl MemoryQueue {
    pub fn new(visibility: Duration) -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            visibility,
            tx,
            rx,
            state: Mutex::new(QueueState::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Background loop returning expired leases to the queue. A worker
    /// that died mid-processing loses its lease here; the original
    /// worker may still be running, which is safe because committing
    /// the same version twice is a no-op.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = std::sync::Arc::clone(self);
        let period = (queue.visibility / 4).max(Duration::from_millis(20));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                for task_id in queue.collect_expired() {
                    tracing::warn!(task_id = %task_id, "lease expired, returning task to queue");
                    let _ = queue.tx.send(task_id).await;
                }
            }
        })
    }

    fn collect_expired(&self) -> Vec<TaskId> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<u64> = state
            .leased
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        expired
            .into_iter()
            .filter_map(|token| state.leased.remove(&token))
            .map(|l| l.task_id)
            .collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task_id: TaskId) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.members.insert(task_id.clone()) {
                return false;
            }
        }
        let _ = self.tx.send(task_id).await;
        true
    }

    async fn lease_next(&self, wait: Duration) -> Option<Lease> {
        let task_id = match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Ok(task_id)) => task_id,
            _ => return None,
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.leased.insert(
            token,
            LeasedTask {
                task_id: task_id.clone(),
                deadline: Instant::now() + self.visibility,
            },
        );
        Some(Lease { task_id, token })
    }

    async fn ack(&self, lease: Lease) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // A stale ack (the sweeper already reclaimed this lease) leaves
        // the requeued task alone.
        if state.leased.remove(&lease.token).is_some() {
            state.members.remove(&lease.task_id);
        }
    }

    async fn nack_requeue(&self, lease: Lease) {
        let reclaimed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.leased.remove(&lease.token).is_some()
        };
        if reclaimed {
            let _ = self.tx.send(lease.task_id).await;
        }
    }
}
