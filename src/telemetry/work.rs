//! Worker and job span helpers.

use tracing::Span;

use crate::job::Job;
use crate::model::WorkerId;

/// Span wrapping a worker's whole lifecycle.
pub fn worker_span(id: &WorkerId) -> Span {
    tracing::info_span!(
        "worker",
        "worker.host" = %id.hostname,
        "worker.pid" = id.pid,
        "worker.queues" = %id.queues.join(","),
    )
}

/// Start a span for job execution.
///
/// The `job.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(job: &Job) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.queue" = %job.queue,
        "job.class" = %job.payload.class,
        "job.id" = %job.payload.id,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
