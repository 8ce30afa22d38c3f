//! Worker pool.
//!
//! A single dequeue loop finds work and hands it to N workers. It only claims
//! a task while holding a permit for an idle worker, so every claimed task is
//! already being computed. Workers run the compute function, encode the result
//! and write it back. A failing or panicking computation becomes an expiring
//! error record; it never takes the worker down.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::queue::TaskQueue;
use crate::store::{Completion, Dequeued};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, start_task_span};

/// Error type returned by compute functions.
pub type ComputeError = Box<dyn std::error::Error + Send + Sync>;

/// Produces the value for an id that is not cached yet.
///
/// Called concurrently from several workers with different ids; makes no
/// assumption about call order.
#[async_trait]
pub trait ReadThroughFn<T>: Send + Sync + 'static {
    async fn compute(&self, priority: i64, id: &str) -> Result<T, ComputeError>;
}

#[async_trait]
impl<T, F, Fut> ReadThroughFn<T> for F
where
    F: Fn(i64, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ComputeError>> + Send + 'static,
    T: Send + 'static,
{
    async fn compute(&self, priority: i64, id: &str) -> Result<T, ComputeError> {
        (self)(priority, id.to_string()).await
    }
}

/// Wrap an async closure as a shareable compute function.
pub fn from_fn<T, F, Fut>(f: F) -> Arc<dyn ReadThroughFn<T>>
where
    F: Fn(i64, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ComputeError>> + Send + 'static,
    T: Send + 'static,
{
    Arc::new(f)
}

/// A claimed task plus the idle-worker permit it was claimed under.
struct Handoff {
    task: Dequeued,
    _permit: OwnedSemaphorePermit,
}

/// Running dequeue loop and workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the dequeue loop and `config.workers` workers. All of them exit
    /// once `shutdown` flips to `true`.
    pub fn start<C: Codec>(
        queue: TaskQueue,
        compute: Arc<dyn ReadThroughFn<C::Value>>,
        codec: Arc<C>,
        config: &CacheConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let idle = Arc::new(Semaphore::new(config.workers));
        // Never full: at most one handoff per permit is in flight.
        let (task_tx, task_rx) = mpsc::channel(config.workers.max(1));
        let task_rx = Arc::new(Mutex::new(task_rx));

        let mut handles = Vec::with_capacity(config.workers + 1);
        handles.push(tokio::spawn(dequeue_loop(
            queue.clone(),
            idle,
            task_tx,
            config.poll_timeout,
            shutdown.clone(),
        )));

        for n in 0..config.workers {
            let worker = Worker {
                n,
                queue: queue.clone(),
                compute_fn: Arc::clone(&compute),
                codec: Arc::clone(&codec),
                error_ttl: config.error_ttl,
            };
            handles.push(tokio::spawn(
                worker.run(Arc::clone(&task_rx), shutdown.clone()),
            ));
        }

        info!(queue = %queue.name(), workers = config.workers, "worker pool started");
        Self { handles }
    }

    pub fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

/// Move tasks from the store to idle workers.
async fn dequeue_loop(
    queue: TaskQueue,
    idle: Arc<Semaphore>,
    tasks: mpsc::Sender<Handoff>,
    poll_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut has_more = false;
    let mut held: Option<OwnedSemaphorePermit> = None;

    loop {
        let permit = match held.take() {
            Some(permit) => permit,
            None => tokio::select! {
                _ = shutdown.changed() => break,
                permit = Arc::clone(&idle).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            },
        };

        if !has_more {
            // A timeout still falls through to a dequeue attempt, which
            // covers markers lost with a crashed process.
            let waited = tokio::select! {
                _ = shutdown.changed() => break,
                waited = queue.wait_for_work(poll_timeout) => waited,
            };
            if let Err(e) = waited {
                error!(queue = %queue.name(), "error waiting for work: {e}");
                held = Some(permit);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(poll_timeout) => continue,
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }

        let task = match queue.dequeue().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                has_more = false;
                held = Some(permit);
                continue;
            }
            Err(e) => {
                error!(queue = %queue.name(), "error dequeuing work: {e}");
                has_more = false;
                held = Some(permit);
                continue;
            }
        };
        has_more = task.remaining > 0;

        let id = task.id.clone();
        let handoff = Handoff {
            task,
            _permit: permit,
        };
        if tasks.send(handoff).await.is_err() {
            warn!(queue = %queue.name(), id = %id, "workers are gone, claimed task stays in progress");
            break;
        }
    }

    debug!(queue = %queue.name(), "dequeue loop stopped");
}

struct Worker<C: Codec> {
    n: usize,
    queue: TaskQueue,
    compute_fn: Arc<dyn ReadThroughFn<C::Value>>,
    codec: Arc<C>,
    error_ttl: Duration,
}

impl<C: Codec> Worker<C> {
    async fn run(
        self,
        tasks: Arc<Mutex<mpsc::Receiver<Handoff>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let handoff = tokio::select! {
                _ = shutdown.changed() => None,
                handoff = async { tasks.lock().await.recv().await } => handoff,
            };
            let Some(Handoff { task, _permit }) = handoff else {
                break;
            };

            let id = task.id.clone();
            tokio::select! {
                _ = shutdown.changed() => {
                    warn!(worker = self.n, id = %id, "abandoning computation on shutdown, it stays in progress");
                    break;
                }
                _ = self.process(task) => {}
            }
            // `_permit` drops here and frees this worker for the next claim.
        }

        debug!(queue = %self.queue.name(), worker = self.n, "worker stopped");
    }

    async fn process(&self, task: Dequeued) {
        let span = start_task_span(self.queue.name(), &task.id, task.priority);
        let start = Instant::now();

        let completion = self.compute(&task).instrument(span.clone()).await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let outcome = match completion {
            Completion::Value(_) => "ok",
            Completion::Error { .. } => "error",
        };
        record_outcome(&span, outcome, elapsed_ms);
        metrics::tasks_completed().add(
            1,
            &[
                KeyValue::new("queue", self.queue.name().to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
        metrics::task_duration_ms().record(
            elapsed_ms,
            &[KeyValue::new("queue", self.queue.name().to_string())],
        );

        if let Err(e) = self.queue.complete(&task.id, &completion).await {
            error!(queue = %self.queue.name(), id = %task.id, "error writing result to store: {e}");
        }
    }

    /// Run the compute function and turn whatever it does into a completion.
    async fn compute(&self, task: &Dequeued) -> Completion {
        let result = AssertUnwindSafe(self.compute_fn.compute(task.priority, &task.id))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(value)) => match self.codec.encode(&value) {
                Ok(bytes) => Completion::Value(bytes),
                Err(e) => self.failure(&task.id, format!("Error encoding worker result: {e}")),
            },
            Ok(Err(e)) => self.failure(&task.id, e.to_string()),
            Err(panic) => self.failure(
                &task.id,
                format!("worker panicked: {}", panic_message(panic.as_ref())),
            ),
        }
    }

    fn failure(&self, id: &str, message: String) -> Completion {
        warn!(queue = %self.queue.name(), id, error = %message, "computation failed");
        Completion::Error {
            message,
            ttl: self.error_ttl,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
