//! Completion notifier.
//!
//! One task owns the map of watched ids. Callers register a one-shot channel
//! for an id and are woken when:
//! - the id is announced on the completion channel,
//! - the result is already stored when the subscription arrives, or
//! - the pub/sub connection was (re)established and a check against the store
//!   finds the id resolved.
//!
//! The last case closes the window in which an announcement can be missed
//! while disconnected. The store stays the source of record; the map only
//! saves callers from polling it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use opentelemetry::KeyValue;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::queue::TaskQueue;
use crate::telemetry::metrics;

enum Request {
    Watch {
        id: String,
        notify: oneshot::Sender<()>,
    },
    /// A caller stopped waiting on `id` and dropped its receiver.
    Release { id: String },
}

/// Caller-side handle to the notifier task. Cheap to clone.
#[derive(Clone)]
pub struct NotifierHandle {
    requests: mpsc::UnboundedSender<Request>,
    watching: Arc<AtomicUsize>,
}

impl NotifierHandle {
    /// Register interest in `id`. The receiver fires once the id is resolved.
    pub fn subscribe(&self, id: &str) -> Result<oneshot::Receiver<()>> {
        let (notify, notified) = oneshot::channel();
        self.requests
            .send(Request::Watch {
                id: id.to_string(),
                notify,
            })
            .map_err(|_| Error::Shutdown)?;
        Ok(notified)
    }

    /// Tell the notifier a receiver for `id` was dropped without being woken,
    /// so it can forget the waiter. Call after dropping the receiver.
    pub fn release(&self, id: &str) {
        // Nothing to clean up once the notifier is gone.
        let _ = self.requests.send(Request::Release { id: id.to_string() });
    }

    /// Number of ids that currently have at least one waiter.
    pub fn watching(&self) -> usize {
        self.watching.load(Ordering::Relaxed)
    }
}

pub struct CompletionNotifier {
    queue: TaskQueue,
    watchers: HashMap<String, Vec<oneshot::Sender<()>>>,
    watching: Arc<AtomicUsize>,
}

impl CompletionNotifier {
    /// Subscribe to the queue's completion channel and spawn the notifier
    /// task. It runs until `shutdown` flips to `true`.
    pub async fn start(
        queue: TaskQueue,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(NotifierHandle, JoinHandle<()>)> {
        let finished = queue.store().subscribe(&queue.keys().channel).await?;
        let (requests, incoming) = mpsc::unbounded_channel();
        let watching = Arc::new(AtomicUsize::new(0));

        let notifier = Self {
            queue,
            watchers: HashMap::new(),
            watching: Arc::clone(&watching),
        };
        let task = tokio::spawn(notifier.run(incoming, finished, shutdown));

        Ok((
            NotifierHandle {
                requests,
                watching,
            },
            task,
        ))
    }

    async fn run(
        mut self,
        mut incoming: mpsc::UnboundedReceiver<Request>,
        mut finished: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                request = incoming.recv() => match request {
                    Some(Request::Watch { id, notify }) => self.watch(id, notify).await,
                    Some(Request::Release { id }) => self.release(&id),
                    None => break,
                },
                message = finished.recv() => match message {
                    // The empty message means we (re)connected.
                    Some(id) if id.is_empty() => self.reconcile().await,
                    Some(id) => self.notify(&id),
                    None => {
                        error!(queue = %self.queue.name(), "completion channel closed");
                        break;
                    }
                },
            }
            self.watching.store(self.watchers.len(), Ordering::Relaxed);
        }

        debug!(queue = %self.queue.name(), "notifier stopped");
    }

    async fn watch(&mut self, id: String, notify: oneshot::Sender<()>) {
        let waiters = self.watchers.entry(id.clone()).or_default();
        // Callers that gave up waiting have dropped their receiver.
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(notify);

        // The result may have been published before we started watching.
        match self.queue.is_finished(&id).await {
            Ok(true) => self.notify(&id),
            Ok(false) => {}
            Err(e) => warn!(queue = %self.queue.name(), id = %id, "unable to check if finished: {e}"),
        }
    }

    /// Drop closed waiters of `id`, and the id itself once none are left.
    fn release(&mut self, id: &str) {
        if let Some(waiters) = self.watchers.get_mut(id) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                self.watchers.remove(id);
            }
        }
    }

    fn notify(&mut self, id: &str) {
        if let Some(waiters) = self.watchers.remove(id) {
            debug!(queue = %self.queue.name(), id, waiters = waiters.len(), "waking waiters");
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// Check every watched id against the store and wake the resolved ones.
    async fn reconcile(&mut self) {
        metrics::notifier_reconnects().add(1, &[KeyValue::new("queue", self.queue.name().to_string())]);

        self.watchers.retain(|_, waiters| {
            waiters.retain(|waiter| !waiter.is_closed());
            !waiters.is_empty()
        });

        let ids: Vec<String> = self.watchers.keys().cloned().collect();
        let mut woken = 0;
        for id in ids {
            match self.queue.is_finished(&id).await {
                Ok(true) => {
                    self.notify(&id);
                    woken += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(queue = %self.queue.name(), id = %id, "unable to check if finished: {e}")
                }
            }
        }

        info!(queue = %self.queue.name(), watched = self.watchers.len() + woken, woken, "reconciled after (re)connect");
    }
}
