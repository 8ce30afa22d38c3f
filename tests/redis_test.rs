use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rtcache::error::Error;
use rtcache::queue::TaskQueue;
use rtcache::store::{Completion, EnqueueOutcome, Lookup, MAX_EXACT_PRIORITY};
use rtcache::worker::{ComputeError, from_fn};
use rtcache::{JsonCodec, ReadThroughCache, RedisStore};
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn test_store() -> Arc<RedisStore> {
    let store = RedisStore::connect(&redis_url()).await.unwrap();
    store.health_check().await.unwrap();
    Arc::new(store)
}

/// A queue name no other test run has used.
fn fresh_queue() -> String {
    format!("test-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn queue_orders_by_priority() {
    let queue = TaskQueue::new(test_store().await, &fresh_queue());

    for (id, priority) in [("a", 3), ("b", 1), ("c", 2)] {
        assert_eq!(queue.enqueue(id, priority).await.unwrap(), EnqueueOutcome::Queued);
    }
    // Worse priority is ignored, better one is taken.
    queue.enqueue("a", 9).await.unwrap();
    assert_eq!(queue.queued(10).await.unwrap(), vec!["b", "c", "a"]);
    queue.enqueue("a", 0).await.unwrap();
    assert_eq!(queue.queued(10).await.unwrap(), vec!["a", "b", "c"]);

    let task = queue.dequeue().await.unwrap().unwrap();
    assert_eq!((task.id.as_str(), task.priority, task.remaining), ("a", 0, 2));
    assert_eq!(queue.enqueue("a", 0).await.unwrap(), EnqueueOutcome::InProgress);
    assert_eq!(queue.in_progress().await.unwrap(), vec!["a"]);
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn completion_replaces_error_and_is_announced() {
    let queue = TaskQueue::new(test_store().await, &fresh_queue());
    let mut finished = queue.store().subscribe(&queue.keys().channel).await.unwrap();
    assert_eq!(finished.recv().await.unwrap(), "", "connect sentinel");

    queue
        .complete(
            "job",
            &Completion::Error {
                message: "nope".to_string(),
                ttl: Duration::from_secs(30),
            },
        )
        .await
        .unwrap();
    assert_eq!(finished.recv().await.unwrap(), "job");
    assert_eq!(queue.lookup("job").await.unwrap(), Lookup::Error("nope".to_string()));
    assert_eq!(queue.enqueue("job", 0).await.unwrap(), EnqueueOutcome::Resolved);

    queue
        .complete("job", &Completion::Value(b"ok".to_vec()))
        .await
        .unwrap();
    assert_eq!(queue.lookup("job").await.unwrap(), Lookup::Value(b"ok".to_vec()));
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn error_record_expires() {
    let queue = TaskQueue::new(test_store().await, &fresh_queue());
    queue
        .complete(
            "short",
            &Completion::Error {
                message: "transient".to_string(),
                ttl: Duration::from_millis(100),
            },
        )
        .await
        .unwrap();
    assert!(queue.is_finished("short").await.unwrap());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!queue.is_finished("short").await.unwrap());
    assert_eq!(queue.lookup("short").await.unwrap(), Lookup::Missing);
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn cache_round_trip_computes_once() {
    let store = test_store().await;
    let queue_name = fresh_queue();
    let calls = Arc::new(AtomicUsize::new(0));
    let compute = from_fn({
        let calls = Arc::clone(&calls);
        move |_priority, id: String| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, ComputeError>(id.len())
            }
        }
    });

    let server = ReadThroughCache::new(
        store.clone(),
        &queue_name,
        Some(compute),
        JsonCodec::<usize>::new(),
        2,
    )
    .await
    .unwrap();
    let client = ReadThroughCache::new(store, &queue_name, None, JsonCodec::<usize>::new(), 0)
        .await
        .unwrap();

    let gets = (0..5)
        .map(|_| server.get(0, "twelve chars"))
        .chain((0..5).map(|_| client.get(0, "twelve chars")));
    for result in join_all(gets).await {
        assert_eq!(result.unwrap(), 12);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn cache_returns_stored_failure() {
    let compute = from_fn(|_priority, _id: String| async move {
        Err::<String, ComputeError>("no such report".into())
    });
    let cache = ReadThroughCache::new(
        test_store().await,
        &fresh_queue(),
        Some(compute),
        JsonCodec::<String>::new(),
        1,
    )
    .await
    .unwrap();

    match cache.get(0, "r-1").await {
        Err(Error::Computation { message, .. }) => assert_eq!(message, "no such report"),
        other => panic!("expected computation error, got {other:?}"),
    }

    cache.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires running Redis; kills every pub/sub client on the server
async fn subscription_survives_connection_loss() {
    let queue = TaskQueue::new(test_store().await, &fresh_queue());
    let mut finished = queue.store().subscribe(&queue.keys().channel).await.unwrap();
    assert_eq!(finished.recv().await.unwrap(), "", "connect sentinel");

    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let killed: i64 = redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("pubsub")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(killed >= 1);

    let sentinel = tokio::time::timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sentinel, "", "reconnect sentinel");

    // Announcements flow again on the new connection.
    queue
        .complete("after", &Completion::Value(b"1".to_vec()))
        .await
        .unwrap();
    let id = tokio::time::timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, "after");
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn priorities_within_exact_range_survive_round_trip() {
    let queue = TaskQueue::new(test_store().await, &fresh_queue());
    let edge = MAX_EXACT_PRIORITY;

    queue.enqueue("high", edge).await.unwrap();
    queue.enqueue("low", -edge).await.unwrap();

    let first = queue.dequeue().await.unwrap().unwrap();
    assert_eq!((first.id.as_str(), first.priority), ("low", -edge));
    let second = queue.dequeue().await.unwrap().unwrap();
    assert_eq!((second.id.as_str(), second.priority), ("high", edge));
}
