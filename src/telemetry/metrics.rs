//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter.

use opentelemetry::metrics::{Counter, Meter};

/// Returns the shared meter for workq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: jobs that reached "done working".
/// Labels: `queue`.
pub fn jobs_processed() -> Counter<u64> {
    meter()
        .u64_counter("workq.jobs.processed")
        .with_description("Number of jobs processed")
        .build()
}

/// Counter: jobs that ended in a failure record.
/// Labels: `queue`, `kind` ("job_execution" | "dirty_exit").
pub fn job_failures() -> Counter<u64> {
    meter()
        .u64_counter("workq.jobs.failed")
        .with_description("Number of failed jobs")
        .build()
}

/// Counter: reservation attempts.
/// Labels: `mode` ("blocking" | "polling"), `result` ("hit" | "empty").
pub fn reservations() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.reservations")
        .with_description("Number of reservation attempts")
        .build()
}

/// Counter: timer callbacks run.
/// Labels: `result` ("ok" | "error").
pub fn timer_callbacks() -> Counter<u64> {
    meter()
        .u64_counter("workq.timer.callbacks")
        .with_description("Number of timer callbacks run")
        .build()
}

/// Counter: stale worker registrations removed by the reaper.
pub fn workers_pruned() -> Counter<u64> {
    meter()
        .u64_counter("workq.workers.pruned")
        .with_description("Dead worker registrations removed")
        .build()
}
