//! Metric instrument factories for rtcache.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"rtcache"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for rtcache instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("rtcache")
}

/// Counter: read-through lookups.
/// Labels: `queue`, `result` ("hit" | "miss" | "error").
pub fn cache_requests() -> Counter<u64> {
    meter()
        .u64_counter("rtcache.cache.requests")
        .with_description("Number of read-through cache lookups")
        .build()
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("rtcache.queue.operations")
        .with_description("Number of task queue operations")
        .build()
}

/// Counter: finished computations.
/// Labels: `queue`, `outcome` ("ok" | "error").
pub fn tasks_completed() -> Counter<u64> {
    meter()
        .u64_counter("rtcache.task.completed")
        .with_description("Number of computations written back to the store")
        .build()
}

/// Histogram: computation duration in milliseconds.
/// Labels: `queue`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("rtcache.task.duration_ms")
        .with_description("Computation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: reconnect reconciliations run by the completion notifier.
/// Labels: `queue`.
pub fn notifier_reconnects() -> Counter<u64> {
    meter()
        .u64_counter("rtcache.notifier.reconnects")
        .with_description("Number of pub/sub (re)connections reconciled")
        .build()
}
