//! Persistent priority task queue.
//!
//! Pending ids live in a sorted set scored by priority; lower scores are
//! served first. Dequeuing moves an id into the in-progress set in the same
//! transaction, which is what keeps two workers from computing the same id.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::Result;
use crate::store::{Completion, Dequeued, EnqueueOutcome, Keys, Lookup, Store};
use crate::telemetry::metrics;

/// Handle to one named queue in a store. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn Store>,
    keys: Arc<Keys>,
    name: Arc<str>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>, queue_name: &str) -> Self {
        Self {
            store,
            keys: Arc::new(Keys::new(queue_name)),
            name: Arc::from(queue_name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Queue `id` for computation unless it is claimed or already resolved.
    ///
    /// Re-enqueueing a queued id only ever improves its priority.
    pub async fn enqueue(&self, id: &str, priority: i64) -> Result<EnqueueOutcome> {
        let outcome = self.store.enqueue(&self.keys, id, priority).await?;
        debug!(queue = %self.name, id, priority, ?outcome, "enqueue");
        self.count(match outcome {
            EnqueueOutcome::Queued => "enqueue",
            EnqueueOutcome::InProgress => "enqueue_in_progress",
            EnqueueOutcome::Resolved => "enqueue_resolved",
        });
        Ok(outcome)
    }

    /// Claim the best-priority task. Returns `None` if the queue is empty.
    pub async fn dequeue(&self) -> Result<Option<Dequeued>> {
        let task = self.store.dequeue(&self.keys).await?;
        match &task {
            Some(task) => {
                debug!(
                    queue = %self.name,
                    id = %task.id,
                    priority = task.priority,
                    remaining = task.remaining,
                    "dequeue"
                );
                self.count("dequeue");
            }
            None => self.count("dequeue_empty"),
        }
        Ok(task)
    }

    /// Store the outcome of a claimed task and announce it.
    pub async fn complete(&self, id: &str, completion: &Completion) -> Result<()> {
        self.store.complete(&self.keys, id, completion).await?;
        self.count(match completion {
            Completion::Value(_) => "complete",
            Completion::Error { .. } => "complete_error",
        });
        Ok(())
    }

    pub async fn lookup(&self, id: &str) -> Result<Lookup> {
        self.store.lookup(&self.keys, id).await
    }

    pub async fn is_finished(&self, id: &str) -> Result<bool> {
        self.store.is_finished(&self.keys, id).await
    }

    /// Block until work is signalled (`true`) or `timeout` passes (`false`).
    pub async fn wait_for_work(&self, timeout: Duration) -> Result<bool> {
        self.store.wait_for_work(&self.keys, timeout).await
    }

    /// Up to `max` queued ids, best priority first.
    pub async fn queued(&self, max: usize) -> Result<Vec<String>> {
        self.store.queued(&self.keys, max).await
    }

    /// Ids currently claimed by a worker.
    pub async fn in_progress(&self) -> Result<Vec<String>> {
        self.store.in_progress(&self.keys).await
    }

    /// Number of queued ids.
    pub async fn pending(&self) -> Result<usize> {
        self.store.pending(&self.keys).await
    }

    fn count(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}
