//! Read-through cache facade.
//!
//! `get` returns a stored value straight away. On a miss it queues the id,
//! waits for the completion notifier to wake it and reads the store again.
//! Concurrent requests for the same id, from this process or any other
//! sharing the store, wait on the same single computation.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::notifier::{CompletionNotifier, NotifierHandle};
use crate::queue::TaskQueue;
use crate::store::{EnqueueOutcome, Lookup, Store};
use crate::telemetry::metrics;
use crate::worker::{ReadThroughFn, WorkerPool};

/// How a wait for a completion ended.
enum Wake {
    Notified,
    NotifierGone,
    TimedOut(Duration),
}

/// A read-through cache over one named queue.
pub struct ReadThroughCache<C: Codec> {
    queue: TaskQueue,
    notifier: NotifierHandle,
    codec: Arc<C>,
    config: CacheConfig,
    workers: usize,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Codec> ReadThroughCache<C> {
    /// Create a cache over `queue_name` with `workers` workers and default
    /// timeouts. `queue_name` must be unique within the store.
    ///
    /// Without a compute function the cache only queues and waits; another
    /// process sharing the store has to run the workers. With one, `workers`
    /// must be at least 1.
    pub async fn new(
        store: Arc<dyn Store>,
        queue_name: &str,
        worker: Option<Arc<dyn ReadThroughFn<C::Value>>>,
        codec: C,
        workers: usize,
    ) -> Result<Self> {
        let config = CacheConfig {
            workers,
            ..CacheConfig::new(queue_name)
        };
        Self::with_config(store, config, worker, codec).await
    }

    pub async fn with_config(
        store: Arc<dyn Store>,
        config: CacheConfig,
        worker: Option<Arc<dyn ReadThroughFn<C::Value>>>,
        codec: C,
    ) -> Result<Self> {
        config.validate()?;
        // A pool without workers would claim ids it can never compute.
        if worker.is_some() && config.workers == 0 {
            return Err(Error::Config(
                "a compute function needs at least one worker".to_string(),
            ));
        }

        let queue = TaskQueue::new(store, &config.queue_name);
        let codec = Arc::new(codec);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (notifier, notifier_task) =
            CompletionNotifier::start(queue.clone(), shutdown_rx.clone()).await?;
        let mut background = vec![notifier_task];

        let workers = match worker {
            Some(worker) => {
                let pool = WorkerPool::start(
                    queue.clone(),
                    worker,
                    Arc::clone(&codec),
                    &config,
                    shutdown_rx,
                );
                background.extend(pool.into_handles());
                config.workers
            }
            None => 0,
        };

        info!(queue = %queue.name(), workers, "read-through cache started");

        Ok(Self {
            queue,
            notifier,
            codec,
            config,
            workers,
            shutdown,
            background: Mutex::new(background),
        })
    }

    /// Return the decoded value for `id`, computing it if necessary.
    pub async fn get(&self, priority: i64, id: &str) -> Result<C::Value> {
        let bytes = self.get_bytes(priority, id).await?;
        self.codec.decode(&bytes)
    }

    /// Like [`get`](Self::get) but returns the stored bytes undecoded.
    pub async fn get_bytes(&self, priority: i64, id: &str) -> Result<Vec<u8>> {
        let result = self.fetch(priority, id).await;
        let label = match &result {
            Ok((_, true)) => "hit",
            Ok((_, false)) => "miss",
            Err(_) => "error",
        };
        metrics::cache_requests().add(
            1,
            &[
                KeyValue::new("queue", self.queue.name().to_string()),
                KeyValue::new("result", label),
            ],
        );
        result.map(|(bytes, _)| bytes)
    }

    /// Make sure `id` is computed without transferring the value. Still waits
    /// for the computation; spawn it to fire and forget.
    pub async fn warm(&self, priority: i64, id: &str) -> Result<()> {
        self.get_bytes(priority, id).await.map(|_| ())
    }

    /// Returns the bytes and whether they were already cached.
    async fn fetch(&self, priority: i64, id: &str) -> Result<(Vec<u8>, bool)> {
        loop {
            if let Some(bytes) = self.stored(id).await? {
                return Ok((bytes, true));
            }
            match self.queue.enqueue(id, priority).await? {
                // Finished between our lookup and the enqueue; read it again.
                EnqueueOutcome::Resolved => continue,
                EnqueueOutcome::Queued | EnqueueOutcome::InProgress => break,
            }
        }

        self.wait_for(id).await.map(|bytes| (bytes, false))
    }

    async fn wait_for(&self, id: &str) -> Result<Vec<u8>> {
        // Declared before the receiver so it is dropped after it.
        let mut guard = WaitGuard {
            notifier: &self.notifier,
            id,
            woken: false,
        };
        let notified = self.notifier.subscribe(id)?;
        let wake = match self.config.wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, notified).await {
                Ok(woken) => wake_from(woken),
                Err(_) => Wake::TimedOut(limit),
            },
            None => wake_from(notified.await),
        };
        guard.woken = matches!(wake, Wake::Notified);

        if let Some(bytes) = self.stored(id).await? {
            return Ok(bytes);
        }

        match wake {
            Wake::Notified => {
                error!(queue = %self.queue.name(), id, "woken but no result stored");
                Err(Error::Unavailable(id.to_string()))
            }
            Wake::NotifierGone => Err(Error::Shutdown),
            Wake::TimedOut(waited) => {
                warn!(queue = %self.queue.name(), id, ?waited, "gave up waiting for result");
                Err(Error::TimedOut {
                    id: id.to_string(),
                    waited,
                })
            }
        }
    }

    /// The stored value, a stored error, or `None` when nothing is stored.
    async fn stored(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match self.queue.lookup(id).await? {
            Lookup::Value(bytes) => Ok(Some(bytes)),
            Lookup::Error(message) => Err(Error::Computation {
                id: id.to_string(),
                message,
            }),
            Lookup::Missing => Ok(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Number of workers this instance runs (0 for a client-only cache).
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Number of ids callers of this instance are currently waiting on.
    pub fn watching(&self) -> usize {
        self.notifier.watching()
    }

    /// Up to `max` queued ids, best priority first.
    pub async fn queued(&self, max: usize) -> Result<Vec<String>> {
        self.queue.queued(max).await
    }

    /// Ids currently being computed by any process.
    pub async fn in_progress(&self) -> Result<Vec<String>> {
        self.queue.in_progress().await
    }

    /// Number of queued ids.
    pub async fn pending(&self) -> Result<usize> {
        self.queue.pending().await
    }

    /// Stop the notifier, the dequeue loop and all workers, and wait for them
    /// to exit. Claimed work stays marked in progress in the store.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.background.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(queue = %self.queue.name(), "background task failed: {e}");
            }
        }

        info!(queue = %self.queue.name(), "read-through cache shut down");
    }
}

impl<C: Codec> Drop for ReadThroughCache<C> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Releases the notifier entry of a wait that ended without a wake-up,
/// including when the caller drops the future mid-wait.
struct WaitGuard<'a> {
    notifier: &'a NotifierHandle,
    id: &'a str,
    woken: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.woken {
            self.notifier.release(self.id);
        }
    }
}

fn wake_from(woken: std::result::Result<(), oneshot::error::RecvError>) -> Wake {
    match woken {
        Ok(()) => Wake::Notified,
        Err(_) => Wake::NotifierGone,
    }
}
