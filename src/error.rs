//! Error types for workq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected at the call site; no state was mutated.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The job's own logic failed.
    #[error("job execution failed: {0}")]
    JobExecution(String),

    /// The child process ended without recording a normal completion.
    #[error("job exited dirty (exit code {code:?}, signal {signal:?})")]
    DirtyExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
