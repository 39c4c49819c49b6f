//! Integration tests for the shared task queue.

use std::sync::Arc;

use serial_archiver::constants::MAX_TASK_FAILURES;
use serial_archiver::queue::{QueueError, Task, TaskQueue};
use serial_archiver::store::{KvStore, MemoryStore};

fn queue() -> TaskQueue {
    TaskQueue::new(Arc::new(MemoryStore::new()) as Arc<dyn KvStore>)
}

fn task(id: &str) -> Task {
    Task::new(id, format!("Series {id}"), "https://reader.example.com/home", vec![1, 2])
}

#[tokio::test]
async fn test_duplicate_enqueue_is_rejected() {
    let queue = queue();

    queue.enqueue(task("t1")).await.unwrap();
    let err = queue.enqueue(task("t1")).await.unwrap_err();

    assert!(matches!(err, QueueError::DuplicateTask(ref id) if id == "t1"));
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_fifo_order() {
    let queue = queue();
    for id in ["a", "b", "c"] {
        queue.enqueue(task(id)).await.unwrap();
    }

    assert_eq!(queue.peek().await.unwrap().unwrap().id, "a");
    let order: Vec<String> = [
        queue.dequeue().await.unwrap(),
        queue.dequeue().await.unwrap(),
        queue.dequeue().await.unwrap(),
    ]
    .into_iter()
    .map(|t| t.unwrap().id)
    .collect();

    assert_eq!(order, ["a", "b", "c"]);
    assert!(queue.dequeue().await.unwrap().is_none());
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_dequeued_id_can_be_enqueued_again() {
    let queue = queue();
    queue.enqueue(task("t1")).await.unwrap();
    queue.dequeue().await.unwrap();

    queue.enqueue(task("t1")).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_task_is_not_requeued_automatically() {
    let queue = queue();
    queue.enqueue(task("t1")).await.unwrap();
    let t = queue.dequeue().await.unwrap().unwrap();

    queue.fail(t, "relay timed out").await.unwrap();

    assert!(queue.is_empty().await.unwrap());
    let failed = queue.failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task.id, "t1");
    assert_eq!(failed[0].error, "relay timed out");
    assert_eq!(failed[0].failures, 1);
    assert!(!failed[0].requeued);
}

#[tokio::test]
async fn test_requeue_moves_task_to_tail() {
    let queue = queue();
    queue.enqueue(task("t1")).await.unwrap();
    let t = queue.dequeue().await.unwrap().unwrap();
    queue.enqueue(task("t2")).await.unwrap();
    queue.fail(t, "boom").await.unwrap();

    queue.requeue_failed("t1").await.unwrap();

    let ids: Vec<String> = queue.list().await.unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, ["t2", "t1"]);
    assert!(queue.failed().await.unwrap()[0].requeued);

    // Already requeued, so there is nothing left to requeue.
    assert!(matches!(
        queue.requeue_failed("t1").await,
        Err(QueueError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_repeated_failures_are_refused() {
    let queue = queue();
    queue.enqueue(task("t1")).await.unwrap();

    for _ in 0..MAX_TASK_FAILURES {
        let t = queue.dequeue().await.unwrap().unwrap();
        queue.fail(t, "still broken").await.unwrap();
        let _ = queue.requeue_failed("t1").await;
    }

    let failed = queue.failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failures, MAX_TASK_FAILURES);
    assert!(queue.is_empty().await.unwrap());
    assert!(matches!(
        queue.requeue_failed("t1").await,
        Err(QueueError::TooManyFailures { failures, .. }) if failures == MAX_TASK_FAILURES
    ));
}

#[tokio::test]
async fn test_clear_failed() {
    let queue = queue();
    queue.fail(task("t1"), "x").await.unwrap();
    queue.fail(task("t2"), "y").await.unwrap();

    queue.clear_failed("t1").await.unwrap();

    let failed = queue.failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task.id, "t2");
}

#[tokio::test]
async fn test_workers_share_one_queue_through_the_store() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let producer = TaskQueue::new(store.clone());
    let consumer = TaskQueue::new(store);

    producer.enqueue(task("t1")).await.unwrap();
    assert_eq!(consumer.dequeue().await.unwrap().unwrap().id, "t1");
    assert!(producer.is_empty().await.unwrap());
}
