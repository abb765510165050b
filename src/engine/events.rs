//! Lifecycle events a worker fires while it runs.
//!
//! Listeners observe; they cannot veto or fail the worker. Every method has
//! a no-op default, so an implementation overrides only what it needs.

use async_trait::async_trait;

use crate::job::Job;
use crate::model::WorkerId;

#[async_trait]
pub trait WorkerEvents: Send + Sync {
    /// The worker finished startup and is registered.
    async fn worker_started(&self, _worker: &WorkerId) {}

    /// A reserved job is about to be handed to a child process.
    async fn before_dispatch(&self, _job: &Job) {}

    /// Right before [`super::Perform::perform`], in the process that
    /// performs the job. The worker fires it for in-process jobs; a child
    /// program with its own listener fires it before calling
    /// [`super::perform_job`].
    async fn before_perform(&self, _job: &Job) {}

    /// The worker is about to unregister.
    async fn worker_stopping(&self, _worker: &WorkerId) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl WorkerEvents for NoEvents {}
