use crate::diff::UnfollowerRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Work decoupled from the polling cycle. Probe/classification runs inline;
/// delivery and glitch re-checks go through the queue so each gets its own
/// retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "task")]
pub enum Task {
    SendDigest {
        user_id: String,
        records: Vec<UnfollowerRecord>,
        unclassified: usize,
    },
    GlitchRecheck {
        user_id: String,
        records: Vec<UnfollowerRecord>,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::SendDigest { .. } => "send-digest",
            Task::GlitchRecheck { .. } => "glitch-recheck",
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Task::SendDigest { user_id, .. } | Task::GlitchRecheck { user_id, .. } => user_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    /// Wait before the first execution.
    pub delay: Duration,
    /// Total attempts before the task is dropped.
    pub max_attempts: u32,
    /// Base wait between retries, doubled per attempt.
    pub retry_backoff: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(60),
        }
    }
}

/// Seam to the durable task queue. The engine only ever enqueues; execution,
/// delivery guarantees and cross-process durability belong to the
/// implementation behind this trait.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task, options: EnqueueOptions) -> Result<Uuid>;
}

/// Consumer side of the queue.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: Task) -> Result<()>;
}

struct Job {
    id: Uuid,
    task: Task,
    options: EnqueueOptions,
    attempt: u32,
    delay: Duration,
}

/// In-process queue implementation: delayed execution via spawned timers,
/// bounded retries with exponential backoff. Jobs do not survive a process
/// restart; a deployment needing durability swaps in another `TaskQueue`.
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl InProcessQueue {
    pub fn start(handler: Arc<dyn TaskHandler>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self { tx: tx.clone() });
        tokio::spawn(run_worker(rx, tx, handler));
        queue
    }
}

#[async_trait]
impl TaskQueue for InProcessQueue {
    async fn enqueue(&self, task: Task, options: EnqueueOptions) -> Result<Uuid> {
        let id = Uuid::new_v4();
        debug!(
            "Enqueuing {name} for {user_id} (delay {delay:?})",
            name = task.name(),
            user_id = task.user_id(),
            delay = options.delay
        );
        self.tx
            .send(Job {
                id,
                delay: options.delay,
                task,
                options,
                attempt: 0,
            })
            .context("Task queue worker has shut down")?;
        Ok(id)
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    tx: mpsc::UnboundedSender<Job>,
    handler: Arc<dyn TaskHandler>,
) {
    while let Some(job) = rx.recv().await {
        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if !job.delay.is_zero() {
                tokio::time::sleep(job.delay).await;
            }

            match handler.handle(job.task.clone()).await {
                Ok(()) => {
                    debug!(
                        "Task {name} {id} for {user_id} completed",
                        name = job.task.name(),
                        id = job.id,
                        user_id = job.task.user_id()
                    );
                }
                Err(e) => {
                    let next_attempt = job.attempt + 1;
                    if next_attempt >= job.options.max_attempts {
                        warn!(
                            "Task {name} {id} for {user_id} failed after {attempts} attempts, dropping: {e}",
                            name = job.task.name(),
                            id = job.id,
                            user_id = job.task.user_id(),
                            attempts = next_attempt
                        );
                        return;
                    }

                    let backoff = job.options.retry_backoff * 2u32.pow(job.attempt);
                    warn!(
                        "Task {name} {id} failed (attempt {attempt}), retrying in {backoff:?}: {e}",
                        name = job.task.name(),
                        id = job.id,
                        attempt = next_attempt
                    );
                    let _ = tx.send(Job {
                        id: job.id,
                        task: job.task,
                        options: job.options,
                        attempt: next_attempt,
                        delay: backoff,
                    });
                }
            }
        });
    }
}
