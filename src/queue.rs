//! FIFO task queue persisted in the shared store.
//!
//! Every mutation is a read-modify-write of one JSON list. That is safe only
//! because the lease holder is the sole dequeuer; producers that enqueue
//! concurrently with each other can still lose a write.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constants::{FAILED_KEY, MAX_TASK_FAILURES, QUEUE_KEY};
use crate::store::{load_json, save_json, KvStore};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0} is already queued")]
    DuplicateTask(String),
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {id} failed {failures} times and will not be requeued")]
    TooManyFailures { id: String, failures: u32 },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// One queued unit of download work: a series and the episodes to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    /// Page the worker must be on before the task can run.
    pub resume_url: String,
    pub items: Vec<u32>,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        resume_url: impl Into<String>,
        items: Vec<u32>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            resume_url: resume_url.into(),
            items,
            enqueued_at: Utc::now(),
        }
    }
}

/// A task that failed and was moved out of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTask {
    pub task: Task,
    pub error: String,
    pub failures: u32,
    pub failed_at: DateTime<Utc>,
    /// Set once the task was put back in the queue.
    #[serde(default)]
    pub requeued: bool,
}

/// Queue handle. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn KvStore>,
}

impl TaskQueue {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn load(&self, key: &str) -> anyhow::Result<Vec<Task>> {
        Ok(load_json(self.store.as_ref(), key).await?.unwrap_or_default())
    }

    async fn save(&self, key: &str, tasks: &[Task]) -> anyhow::Result<()> {
        save_json(self.store.as_ref(), key, tasks).await
    }

    /// Append a task unless one with the same id is already queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateTask`] without mutating the queue if the
    /// id is present, or a store error.
    pub async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let mut tasks = self.load(QUEUE_KEY).await?;
        if tasks.iter().any(|t| t.id == task.id) {
            return Err(QueueError::DuplicateTask(task.id));
        }
        info!(task_id = %task.id, title = %task.title, items = task.items.len(), "Task enqueued");
        tasks.push(task);
        self.save(QUEUE_KEY, &tasks).await?;
        Ok(())
    }

    /// The head task, without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn peek(&self) -> anyhow::Result<Option<Task>> {
        Ok(self.load(QUEUE_KEY).await?.into_iter().next())
    }

    /// Remove and return the head task.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn dequeue(&self) -> anyhow::Result<Option<Task>> {
        let mut tasks = self.load(QUEUE_KEY).await?;
        if tasks.is_empty() {
            return Ok(None);
        }
        let head = tasks.remove(0);
        self.save(QUEUE_KEY, &tasks).await?;
        debug!(task_id = %head.id, remaining = tasks.len(), "Task dequeued");
        Ok(Some(head))
    }

    /// All queued tasks, head first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list(&self) -> anyhow::Result<Vec<Task>> {
        self.load(QUEUE_KEY).await
    }

    /// Number of queued tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.load(QUEUE_KEY).await?.len())
    }

    /// Whether the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Record a failed task. It is not put back in the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn fail(&self, task: Task, error: &str) -> anyhow::Result<()> {
        let mut failed = self.failed().await?;
        let failures = match failed.iter().position(|f| f.task.id == task.id) {
            Some(pos) => failed.remove(pos).failures + 1,
            None => 1,
        };
        warn!(task_id = %task.id, failures, "Task moved to failed list");
        failed.push(FailedTask {
            task,
            error: error.to_string(),
            failures,
            failed_at: Utc::now(),
            requeued: false,
        });
        save_json(self.store.as_ref(), FAILED_KEY, &failed).await
    }

    /// Failure records, including ones already requeued.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn failed(&self) -> anyhow::Result<Vec<FailedTask>> {
        Ok(load_json(self.store.as_ref(), FAILED_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Move a failed task back to the tail of the queue.
    ///
    /// The failed record stays (marked requeued) so the failure count
    /// survives another failure; a task that keeps failing is eventually
    /// refused.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if no failed task has this id,
    /// [`QueueError::TooManyFailures`] once it reached the limit, or
    /// [`QueueError::DuplicateTask`] if the id is already queued again.
    pub async fn requeue_failed(&self, id: &str) -> Result<(), QueueError> {
        let mut failed = self.failed().await?;
        let entry = failed
            .iter_mut()
            .find(|f| f.task.id == id && !f.requeued)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if entry.failures >= MAX_TASK_FAILURES {
            return Err(QueueError::TooManyFailures {
                id: id.to_string(),
                failures: entry.failures,
            });
        }

        let mut task = entry.task.clone();
        task.enqueued_at = Utc::now();
        self.enqueue(task).await?;

        entry.requeued = true;
        save_json(self.store.as_ref(), FAILED_KEY, &failed)
            .await
            .context("Failed to update failed list")?;
        info!(task_id = %id, "Failed task requeued");
        Ok(())
    }

    /// Forget the failure record of a task that has since succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn clear_failed(&self, id: &str) -> anyhow::Result<()> {
        let mut failed = self.failed().await?;
        let before = failed.len();
        failed.retain(|f| f.task.id != id);
        if failed.len() != before {
            save_json(self.store.as_ref(), FAILED_KEY, &failed).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

/// Parse an item list such as `1-3,7,10-11` into episode numbers.
///
/// Order is preserved and duplicates are dropped.
///
/// # Errors
///
/// Returns an error for malformed numbers or descending ranges.
pub fn parse_item_ranges(spec: &str) -> anyhow::Result<Vec<u32>> {
    let mut items = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.trim().parse().with_context(|| format!("bad range start in {part}"))?;
            let hi: u32 = hi.trim().parse().with_context(|| format!("bad range end in {part}"))?;
            anyhow::ensure!(lo <= hi, "descending range {part}");
            items.extend(lo..=hi);
        } else {
            items.push(part.parse().with_context(|| format!("bad item {part}"))?);
        }
    }
    let mut seen = std::collections::HashSet::new();
    items.retain(|i| seen.insert(*i));
    Ok(items)
}
