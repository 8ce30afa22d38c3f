//! In-process store.
//!
//! Mirrors the Redis semantics closely enough to run the whole cache in a
//! single process: equal priorities are ordered by id, error records expire,
//! and completions are fanned out to subscribers. Used by the test suite and
//! for embedding without an external store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;

use super::{Completion, Dequeued, EnqueueOutcome, Keys, Lookup, Store};
use crate::error::Result;

#[derive(Default)]
struct State {
    /// Sorted set members per queue key, ordered by (score, member).
    queues: HashMap<String, BTreeSet<(i64, String)>>,
    scores: HashMap<String, HashMap<String, i64>>,
    ready: HashMap<String, usize>,
    claimed: HashMap<String, HashSet<String>>,
    values: HashMap<String, Vec<u8>>,
    errors: HashMap<String, (String, Instant)>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    disconnected: bool,
}

impl State {
    fn error(&mut self, key: &str) -> Option<String> {
        match self.errors.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                self.errors.remove(key);
                None
            }
            Some((message, _)) => Some(message.clone()),
            None => None,
        }
    }

    fn is_finished(&mut self, keys: &Keys, id: &str) -> bool {
        self.values.contains_key(&keys.value(id)) || self.error(&keys.error(id)).is_some()
    }

    fn publish(&mut self, channel: &str, message: &str) {
        if self.disconnected {
            return;
        }
        if let Some(subs) = self.subscribers.get_mut(channel) {
            subs.retain(|tx| tx.send(message.to_string()).is_ok());
        }
    }
}

/// Store that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    work_signal: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the pub/sub connection. Completions published until
    /// [`reconnect`](Self::reconnect) are not delivered.
    pub async fn disconnect(&self) {
        self.state.lock().await.disconnected = true;
    }

    /// Restore pub/sub delivery and send the reconnect sentinel to every
    /// subscriber.
    pub async fn reconnect(&self) {
        let mut state = self.state.lock().await;
        state.disconnected = false;
        let channels: Vec<String> = state.subscribers.keys().cloned().collect();
        for channel in channels {
            state.publish(&channel, "");
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn enqueue(&self, keys: &Keys, id: &str, priority: i64) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;

        if state
            .claimed
            .get(&keys.in_progress)
            .is_some_and(|set| set.contains(id))
        {
            return Ok(EnqueueOutcome::InProgress);
        }
        if state.is_finished(keys, id) {
            return Ok(EnqueueOutcome::Resolved);
        }

        let old = state
            .scores
            .get(&keys.queue)
            .and_then(|scores| scores.get(id))
            .copied();
        if old.is_none_or(|old| priority < old) {
            let queue = state.queues.entry(keys.queue.clone()).or_default();
            if let Some(old) = old {
                queue.remove(&(old, id.to_string()));
            }
            queue.insert((priority, id.to_string()));
            state
                .scores
                .entry(keys.queue.clone())
                .or_default()
                .insert(id.to_string(), priority);
            *state.ready.entry(keys.work_ready.clone()).or_default() += 1;
            drop(state);
            self.work_signal.notify_waiters();
        }

        Ok(EnqueueOutcome::Queued)
    }

    async fn dequeue(&self, keys: &Keys) -> Result<Option<Dequeued>> {
        let mut state = self.state.lock().await;

        let Some(queue) = state.queues.get_mut(&keys.queue) else {
            return Ok(None);
        };
        let Some((priority, id)) = queue.pop_first() else {
            return Ok(None);
        };
        let remaining = queue.len();

        if let Some(scores) = state.scores.get_mut(&keys.queue) {
            scores.remove(&id);
        }
        state
            .claimed
            .entry(keys.in_progress.clone())
            .or_default()
            .insert(id.clone());

        Ok(Some(Dequeued {
            id,
            priority,
            remaining,
        }))
    }

    async fn complete(&self, keys: &Keys, id: &str, completion: &Completion) -> Result<()> {
        let mut state = self.state.lock().await;

        match completion {
            Completion::Value(bytes) => {
                state.errors.remove(&keys.error(id));
                state.values.insert(keys.value(id), bytes.clone());
            }
            Completion::Error { message, ttl } => {
                state.values.remove(&keys.value(id));
                state
                    .errors
                    .insert(keys.error(id), (message.clone(), Instant::now() + *ttl));
            }
        }
        if let Some(set) = state.claimed.get_mut(&keys.in_progress) {
            set.remove(id);
        }
        state.publish(&keys.channel, id);

        Ok(())
    }

    async fn lookup(&self, keys: &Keys, id: &str) -> Result<Lookup> {
        let mut state = self.state.lock().await;

        if let Some(message) = state.error(&keys.error(id)) {
            return Ok(Lookup::Error(message));
        }
        Ok(match state.values.get(&keys.value(id)) {
            Some(bytes) => Lookup::Value(bytes.clone()),
            None => Lookup::Missing,
        })
    }

    async fn is_finished(&self, keys: &Keys, id: &str) -> Result<bool> {
        Ok(self.state.lock().await.is_finished(keys, id))
    }

    async fn wait_for_work(&self, keys: &Keys, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.work_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                match state.ready.get_mut(&keys.work_ready) {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                        return Ok(true);
                    }
                    _ => {}
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(false);
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        if !state.disconnected {
            let _ = tx.send(String::new());
        }
        state
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn queued(&self, keys: &Keys, max: usize) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(&keys.queue)
            .map(|queue| queue.iter().take(max).map(|(_, id)| id.clone()).collect())
            .unwrap_or_default())
    }

    async fn in_progress(&self, keys: &Keys) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .claimed
            .get(&keys.in_progress)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn pending(&self, keys: &Keys) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.queues.get(&keys.queue).map_or(0, BTreeSet::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keys {
        Keys::new("memory-test")
    }

    #[tokio::test]
    async fn dequeue_pops_lowest_priority_first() {
        let store = MemoryStore::new();
        let keys = keys();

        store.enqueue(&keys, "a", 3).await.unwrap();
        store.enqueue(&keys, "b", 1).await.unwrap();
        store.enqueue(&keys, "c", 2).await.unwrap();

        let first = store.dequeue(&keys).await.unwrap().unwrap();
        assert_eq!(first.id, "b");
        assert_eq!(first.priority, 1);
        assert_eq!(first.remaining, 2);
        assert_eq!(store.in_progress(&keys).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn equal_priorities_order_by_id() {
        let store = MemoryStore::new();
        let keys = keys();

        store.enqueue(&keys, "zeta", 1).await.unwrap();
        store.enqueue(&keys, "alpha", 1).await.unwrap();

        assert_eq!(store.queued(&keys, 10).await.unwrap(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn empty_queue_dequeues_none() {
        let store = MemoryStore::new();
        assert!(store.dequeue(&keys()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_replaces_error_with_value() {
        let store = MemoryStore::new();
        let keys = keys();

        let failed = Completion::Error {
            message: "boom".to_string(),
            ttl: Duration::from_secs(60),
        };
        store.complete(&keys, "x", &failed).await.unwrap();
        assert_eq!(
            store.lookup(&keys, "x").await.unwrap(),
            Lookup::Error("boom".to_string())
        );

        store
            .complete(&keys, "x", &Completion::Value(b"ok".to_vec()))
            .await
            .unwrap();
        assert_eq!(
            store.lookup(&keys, "x").await.unwrap(),
            Lookup::Value(b"ok".to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn error_records_expire() {
        let store = MemoryStore::new();
        let keys = keys();

        let failed = Completion::Error {
            message: "boom".to_string(),
            ttl: Duration::from_secs(10),
        };
        store.complete(&keys, "x", &failed).await.unwrap();
        assert!(store.is_finished(&keys, "x").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.is_finished(&keys, "x").await.unwrap());
        assert_eq!(store.lookup(&keys, "x").await.unwrap(), Lookup::Missing);
    }

    #[tokio::test]
    async fn wait_for_work_consumes_markers() {
        let store = MemoryStore::new();
        let keys = keys();

        store.enqueue(&keys, "a", 1).await.unwrap();
        assert!(
            store
                .wait_for_work(&keys, Duration::from_millis(10))
                .await
                .unwrap()
        );
        assert!(
            !store
                .wait_for_work(&keys, Duration::from_millis(10))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn subscribers_see_sentinel_and_completions() {
        let store = MemoryStore::new();
        let keys = keys();

        let mut rx = store.subscribe(&keys.channel).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "");

        store
            .complete(&keys, "x", &Completion::Value(vec![1]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn disconnect_drops_completions_until_reconnect() {
        let store = MemoryStore::new();
        let keys = keys();

        let mut rx = store.subscribe(&keys.channel).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "");

        store.disconnect().await;
        store
            .complete(&keys, "x", &Completion::Value(vec![1]))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        store.reconnect().await;
        assert_eq!(rx.recv().await.unwrap(), "");
    }
}
