//! The polling worker loop.
//!
//! Every worker polls the shared queue. Whichever acquires the lease runs
//! the head task; the others find the lease held and wait for the next
//! poll. A task whose resume location differs from the worker's current
//! location is parked in an active-task record while the worker navigates,
//! and picked up again by the next poll with the lease still held.

mod pipeline;

pub use pipeline::{ArchivePipeline, PipelineSettings};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::ACTIVE_TASK_KEY;
use crate::error::TransferError;
use crate::lock::LockManager;
use crate::queue::{Task, TaskQueue};
use crate::store::{load_json, save_json, KvStore};

/// The worker's own page: where it is and how to move it.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn current_location(&self) -> Result<String>;

    async fn navigate(&self, url: &str) -> Result<()>;
}

/// Invalidates downstream caches for a storage container.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, container_id: &str) -> Result<(), TransferError>;
}

/// What one task achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSummary {
    pub items_archived: usize,
    /// Items that failed, with the error text.
    pub items_failed: Vec<(u32, String)>,
    pub bytes_uploaded: u64,
}

/// Runs one dequeued task to completion.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> Result<TaskSummary, TransferError>;
}

/// Receives one summary per finished task.
pub trait Notifier: Send + Sync {
    fn task_succeeded(&self, task: &Task, summary: &TaskSummary);

    fn task_failed(&self, task: &Task, error: &TransferError);
}

/// Notifier that writes summaries to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn task_succeeded(&self, task: &Task, summary: &TaskSummary) {
        info!(
            task_id = %task.id,
            title = %task.title,
            archived = summary.items_archived,
            failed = summary.items_failed.len(),
            bytes = summary.bytes_uploaded,
            "Task finished"
        );
    }

    fn task_failed(&self, task: &Task, error: &TransferError) {
        error!(task_id = %task.id, title = %task.title, error = %error, "Task failed");
    }
}

/// A task that left the queue and is waiting for its worker to arrive at
/// the resume location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTask {
    pub task: Task,
    pub holder_id: String,
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing queued.
    Idle,
    /// Another worker holds the lease.
    LockUnavailable,
    /// A task is already running in this worker.
    Busy,
    /// Moved to the task's resume location; the lease stays held.
    Navigated { task_id: String },
    Completed { task_id: String },
    Failed { task_id: String },
}

pub struct QueueProcessor {
    queue: TaskQueue,
    store: Arc<dyn KvStore>,
    lock: LockManager,
    navigator: Arc<dyn Navigator>,
    runner: Arc<dyn TaskRunner>,
    notifier: Arc<dyn Notifier>,
    poll_interval: Duration,
    running: AtomicBool,
}

/// Clears the running flag however the task ends.
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl QueueProcessor {
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        lock: LockManager,
        navigator: Arc<dyn Navigator>,
        runner: Arc<dyn TaskRunner>,
        notifier: Arc<dyn Notifier>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue: TaskQueue::new(Arc::clone(&store)),
            store,
            lock,
            navigator,
            runner,
            notifier,
            poll_interval,
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Poll until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker = %self.lock.identity(),
            poll_secs = self.poll_interval.as_secs(),
            "Starting queue processor"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(outcome) => debug!(?outcome, "Poll finished"),
                        Err(e) => error!("Queue poll failed: {e:#}"),
                    }
                }
                () = shutdown.cancelled() => {
                    info!("Queue processor shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.lock.release().await {
            warn!("Failed to release lease on shutdown: {e:#}");
        }
    }

    /// One poll of the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails before a task was taken. Once a
    /// task is taken, failures end up in the failed list instead.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let parked: Option<ActiveTask> = self.load_active().await;
        if parked.is_none() && self.queue.peek().await?.is_none() {
            return Ok(TickOutcome::Idle);
        }

        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(TickOutcome::Busy);
        }
        let _running = RunningFlag(&self.running);

        if !self.lock.acquire().await? {
            return Ok(TickOutcome::LockUnavailable);
        }

        let result = self.run_locked(parked).await;

        // The lease survives only a navigation, which the next poll resumes.
        if !matches!(result, Ok(TickOutcome::Navigated { .. })) {
            if let Err(e) = self.lock.release().await {
                warn!("Failed to release lease: {e:#}");
            }
        }
        result
    }

    async fn run_locked(&self, parked: Option<ActiveTask>) -> Result<TickOutcome> {
        let had_record = parked.is_some();
        let resumed = match parked {
            Some(active) if active.holder_id == self.lock.identity().as_str() => {
                debug!(task_id = %active.task.id, "Resuming task after navigation");
                Some(active.task)
            }
            Some(active) => {
                // Its worker lost the lease mid-navigation. The task already
                // left the queue, so it is not run again.
                let reason = TransferError::CoordinationTimeout(format!(
                    "task {} abandoned by worker {}",
                    active.task.id, active.holder_id
                ));
                warn!(task_id = %active.task.id, error = %reason, "Dropping parked task");
                self.queue.fail(active.task, &reason.to_string()).await?;
                None
            }
            None => None,
        };
        if had_record {
            self.store.delete(ACTIVE_TASK_KEY).await?;
        }

        let task = match resumed {
            Some(task) => task,
            None => match self.queue.dequeue().await? {
                Some(task) => task,
                None => return Ok(TickOutcome::Idle),
            },
        };

        match self.at_resume_location(&task).await {
            Ok(true) => {}
            Ok(false) => return self.park_and_navigate(task).await,
            Err(e) => return self.finish(task, Err(TransferError::Other(e))).await,
        }

        info!(task_id = %task.id, title = %task.title, items = task.items.len(), "Running task");
        let renewal = self.lock.start_renewal();
        let result = self.runner.run(&task).await;
        drop(renewal);

        self.finish(task, result).await
    }

    async fn at_resume_location(&self, task: &Task) -> Result<bool> {
        let here = self.navigator.current_location().await?;
        Ok(same_location(&here, &task.resume_url))
    }

    async fn park_and_navigate(&self, task: Task) -> Result<TickOutcome> {
        let active = ActiveTask {
            task,
            holder_id: self.lock.identity().as_str().to_string(),
        };
        // A page load may outlast the lease timeout.
        let renewal = self.lock.start_renewal();
        save_json(self.store.as_ref(), ACTIVE_TASK_KEY, &active).await?;

        info!(task_id = %active.task.id, url = %active.task.resume_url, "Navigating to task location");
        let navigated = self.navigator.navigate(&active.task.resume_url).await;
        drop(renewal);
        if let Err(e) = navigated {
            self.store.delete(ACTIVE_TASK_KEY).await?;
            return self.finish(active.task, Err(TransferError::Other(e))).await;
        }
        Ok(TickOutcome::Navigated {
            task_id: active.task.id,
        })
    }

    async fn finish(
        &self,
        task: Task,
        result: Result<TaskSummary, TransferError>,
    ) -> Result<TickOutcome> {
        let task_id = task.id.clone();
        match result {
            Ok(summary) => {
                if let Err(e) = self.queue.clear_failed(&task.id).await {
                    warn!(task_id = %task.id, "Failed to clear earlier failure record: {e:#}");
                }
                self.notifier.task_succeeded(&task, &summary);
                Ok(TickOutcome::Completed { task_id })
            }
            Err(e) => {
                self.notifier.task_failed(&task, &e);
                self.queue.fail(task, &e.to_string()).await?;
                Ok(TickOutcome::Failed { task_id })
            }
        }
    }

    async fn load_active(&self) -> Option<ActiveTask> {
        match load_json(self.store.as_ref(), ACTIVE_TASK_KEY).await {
            Ok(active) => active,
            Err(e) => {
                warn!("Ignoring unreadable active task record: {e:#}");
                None
            }
        }
    }
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("lock", &self.lock)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Compare page locations, ignoring fragments and trailing slashes.
#[must_use]
pub fn same_location(a: &str, b: &str) -> bool {
    fn normalize(url: &str) -> &str {
        let url = url.split('#').next().unwrap_or(url);
        url.trim_end_matches('/')
    }
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_location() {
        assert!(same_location("https://a.example/s/1/", "https://a.example/s/1"));
        assert!(same_location("https://a.example/s/1#top", "https://a.example/s/1"));
        assert!(!same_location("https://a.example/s/1", "https://a.example/s/2"));
    }

    #[test]
    fn test_active_task_record_format() {
        let active = ActiveTask {
            task: Task::new("t", "T", "https://a.example", vec![1]),
            holder_id: "worker-1".to_string(),
        };
        let json = serde_json::to_value(&active).unwrap();
        assert_eq!(json["holderId"], "worker-1");
        assert_eq!(json["task"]["resumeUrl"], "https://a.example");
    }
}
