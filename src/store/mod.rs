//! Backing store adapter.
//!
//! The store is the single source of truth for queue state, claims and
//! results. Every operation that touches more than one key runs as one atomic
//! transaction so that racing workers in different processes never observe a
//! half-applied change.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Prefix shared by every key a read-through cache writes.
pub const QUEUE_PREFIX: &str = "rc:";

/// Marker pushed onto the work-ready list on every successful enqueue.
pub const WORK_READY_MARKER: &str = "W";

/// Largest priority magnitude a Redis sorted-set score (a double) holds
/// exactly. Priorities beyond `±MAX_EXACT_PRIORITY` are rounded, so nearby
/// values may tie or reorder.
pub const MAX_EXACT_PRIORITY: i64 = 1 << 53;

/// Key layout for one logical queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    /// Sorted set of pending ids, scored by priority.
    pub queue: String,
    /// List of work-ready markers.
    pub work_ready: String,
    /// Set of ids currently claimed by a worker.
    pub in_progress: String,
    /// Pub/sub channel on which finished ids are announced.
    pub channel: String,
    value_prefix: String,
    error_prefix: String,
}

impl Keys {
    pub fn new(queue_name: &str) -> Self {
        let queue = format!("{QUEUE_PREFIX}{queue_name}");
        Self {
            work_ready: format!("{queue}:wr"),
            in_progress: format!("{queue}:inp"),
            channel: format!("{queue}:ch"),
            value_prefix: format!("{queue}:k:"),
            error_prefix: format!("{queue}:er:"),
            queue,
        }
    }

    /// Key of the success payload for `id`.
    pub fn value(&self, id: &str) -> String {
        format!("{}{id}", self.value_prefix)
    }

    /// Key of the (expiring) error message for `id`.
    pub fn error(&self, id: &str) -> String {
        format!("{}{id}", self.error_prefix)
    }
}

/// What an enqueue found for the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The id is (now) waiting in the queue.
    Queued,
    /// A worker has already claimed the id. Nothing was changed.
    InProgress,
    /// A result or error record exists. Nothing was changed.
    Resolved,
}

impl EnqueueOutcome {
    /// True when no further work needs to be scheduled for the id.
    pub fn already_resolved(self) -> bool {
        !matches!(self, EnqueueOutcome::Queued)
    }
}

/// A task popped off the queue and claimed by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dequeued {
    pub id: String,
    pub priority: i64,
    /// Entries left in the queue after the pop.
    pub remaining: usize,
}

/// What a worker writes back once the computation ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Value(Vec<u8>),
    Error { message: String, ttl: Duration },
}

/// The stored state of an id's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Value(Vec<u8>),
    Error(String),
    Missing,
}

/// Atomic operations the cache needs from its backing store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Queue `id` unless it is claimed or already has a result or error.
    /// An existing entry is only updated when `priority` improves on it.
    ///
    /// Priorities are exact only within `±`[`MAX_EXACT_PRIORITY`]; the Redis
    /// store keeps them as doubles.
    async fn enqueue(&self, keys: &Keys, id: &str, priority: i64) -> Result<EnqueueOutcome>;

    /// Pop the best-priority entry and claim it. `None` when the queue is empty.
    async fn dequeue(&self, keys: &Keys) -> Result<Option<Dequeued>>;

    /// Write the outcome, release the claim and announce `id` on the channel.
    async fn complete(&self, keys: &Keys, id: &str, completion: &Completion) -> Result<()>;

    async fn lookup(&self, keys: &Keys, id: &str) -> Result<Lookup>;

    /// True when either a value or an error is stored for `id`.
    async fn is_finished(&self, keys: &Keys, id: &str) -> Result<bool>;

    /// Block until a work-ready marker is consumed (`true`) or `timeout`
    /// elapses (`false`).
    async fn wait_for_work(&self, keys: &Keys, timeout: Duration) -> Result<bool>;

    /// Subscribe to completion messages on `channel`. The empty string is
    /// delivered every time the subscription is (re)established.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>>;

    /// Up to `max` queued ids in priority order.
    async fn queued(&self, keys: &Keys, max: usize) -> Result<Vec<String>>;

    async fn in_progress(&self, keys: &Keys) -> Result<Vec<String>>;

    /// Number of queued entries.
    async fn pending(&self, keys: &Keys) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_queue_name() {
        let keys = Keys::new("diffs");
        assert_eq!(keys.queue, "rc:diffs");
        assert_eq!(keys.work_ready, "rc:diffs:wr");
        assert_eq!(keys.in_progress, "rc:diffs:inp");
        assert_eq!(keys.channel, "rc:diffs:ch");
        assert_eq!(keys.value("a-b"), "rc:diffs:k:a-b");
        assert_eq!(keys.error("a-b"), "rc:diffs:er:a-b");
    }

    #[test]
    fn only_queued_needs_work() {
        assert!(!EnqueueOutcome::Queued.already_resolved());
        assert!(EnqueueOutcome::InProgress.already_resolved());
        assert!(EnqueueOutcome::Resolved.already_resolved());
    }
}
