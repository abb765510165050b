//! Worker engine: registration, reservation, isolated dispatch and the
//! control plane that steers it.

pub mod control;
pub mod dispatch;
pub mod events;
pub mod reaper;
pub mod registry;
pub mod reserve;
pub mod worker;

pub use control::{Control, SignalListener, WorkerHandle};
pub use dispatch::{ChildExit, ChildProcess, CommandSpawner, Perform, Spawner, perform_job};
pub use events::{NoEvents, WorkerEvents};
pub use worker::{Worker, WorkerOptions};

use tracing::error;

use crate::error::Result;

/// Bookkeeping writes must not stop the worker. Log and move on.
pub(crate) fn log_store_error(context: &str, result: Result<()>) {
    if let Err(e) = result {
        error!(error = %e, "{context} failed");
    }
}
