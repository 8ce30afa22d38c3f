//! Computation span helpers.
//!
//! Provides span creation and outcome recording for tasks flowing through
//! the worker pool.

use tracing::Span;

/// Start a span for one computation.
///
/// The `task.outcome` field is declared empty and can be filled via
/// [`record_outcome`].
pub fn start_task_span(queue: &str, id: &str, priority: i64) -> Span {
    tracing::info_span!(
        "task.compute",
        "task.queue" = queue,
        "task.id" = id,
        "task.priority" = priority,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record how the computation ended and emit an event scoped to the span.
pub fn record_outcome(span: &Span, outcome: &str, duration_ms: f64) {
    span.record("task.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome, duration_ms, "task finished");
    });
}
