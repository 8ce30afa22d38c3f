use std::sync::Arc;
use std::time::Duration;

use rtcache::MemoryStore;
use rtcache::queue::TaskQueue;
use rtcache::store::{Completion, EnqueueOutcome, Lookup};

fn test_queue() -> TaskQueue {
    TaskQueue::new(Arc::new(MemoryStore::new()), "queue-test")
}

async fn drain(queue: &TaskQueue) -> Vec<String> {
    let mut ids = Vec::new();
    while let Some(task) = queue.dequeue().await.unwrap() {
        ids.push(task.id);
    }
    ids
}

#[tokio::test]
async fn dequeues_lowest_priority_first() {
    let queue = test_queue();

    for (id, priority) in [("a", 3), ("b", 1), ("c", 2)] {
        assert_eq!(queue.enqueue(id, priority).await.unwrap(), EnqueueOutcome::Queued);
    }
    assert_eq!(queue.pending().await.unwrap(), 3);
    assert_eq!(queue.queued(10).await.unwrap(), vec!["b", "c", "a"]);

    let first = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(first.id, "b");
    assert_eq!(first.priority, 1);
    assert_eq!(first.remaining, 2);

    assert_eq!(drain(&queue).await, vec!["c", "a"]);
    assert_eq!(queue.in_progress().await.unwrap().len(), 3);
}

#[tokio::test]
async fn requeue_only_improves_priority() {
    let queue = test_queue();
    queue.enqueue("x", 5).await.unwrap();
    queue.enqueue("y", 3).await.unwrap();

    // A worse priority leaves x where it is.
    assert_eq!(queue.enqueue("x", 10).await.unwrap(), EnqueueOutcome::Queued);
    assert_eq!(queue.queued(10).await.unwrap(), vec!["y", "x"]);
    assert_eq!(queue.pending().await.unwrap(), 2);

    // A better one moves it ahead.
    assert_eq!(queue.enqueue("x", 1).await.unwrap(), EnqueueOutcome::Queued);
    assert_eq!(queue.queued(10).await.unwrap(), vec!["x", "y"]);
    assert_eq!(queue.pending().await.unwrap(), 2);
}

#[tokio::test]
async fn enqueue_of_resolved_id_changes_nothing() {
    let queue = test_queue();
    queue
        .complete("done", &Completion::Value(b"42".to_vec()))
        .await
        .unwrap();
    queue
        .complete(
            "failed",
            &Completion::Error {
                message: "boom".to_string(),
                ttl: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();

    for id in ["done", "failed"] {
        let outcome = queue.enqueue(id, 0).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Resolved);
        assert!(outcome.already_resolved());
    }

    assert_eq!(queue.pending().await.unwrap(), 0);
    assert!(!queue.wait_for_work(Duration::from_millis(20)).await.unwrap());
    assert_eq!(queue.lookup("done").await.unwrap(), Lookup::Value(b"42".to_vec()));
    assert_eq!(
        queue.lookup("failed").await.unwrap(),
        Lookup::Error("boom".to_string())
    );
}

#[tokio::test]
async fn enqueue_of_claimed_id_reports_in_progress() {
    let queue = test_queue();
    queue.enqueue("slow", 0).await.unwrap();
    let task = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(task.remaining, 0);

    assert_eq!(queue.enqueue("slow", 0).await.unwrap(), EnqueueOutcome::InProgress);
    assert_eq!(queue.pending().await.unwrap(), 0);
    assert!(!queue.is_finished("slow").await.unwrap());

    queue
        .complete("slow", &Completion::Value(Vec::new()))
        .await
        .unwrap();
    assert!(queue.is_finished("slow").await.unwrap());
    assert!(queue.in_progress().await.unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_signals_waiting_worker() {
    let queue = test_queue();

    let waiter = tokio::spawn({
        let queue = queue.clone();
        async move { queue.wait_for_work(Duration::from_secs(5)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.enqueue("ping", 0).await.unwrap();

    assert!(waiter.await.unwrap().unwrap());
}

#[tokio::test]
async fn queues_with_different_names_are_independent() {
    let store = Arc::new(MemoryStore::new());
    let left = TaskQueue::new(store.clone(), "left");
    let right = TaskQueue::new(store, "right");

    left.enqueue("shared-id", 0).await.unwrap();
    left.complete("shared-id", &Completion::Value(b"left".to_vec()))
        .await
        .unwrap();

    assert_eq!(right.lookup("shared-id").await.unwrap(), Lookup::Missing);
    assert_eq!(right.enqueue("shared-id", 0).await.unwrap(), EnqueueOutcome::Queued);
}
