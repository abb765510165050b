//! Hook handlers: job classes mapped to executables.
//!
//! Each `.toml` file in the handlers directory declares one handler:
//!
//! ```toml
//! [handler]
//! class = "SendEmail"
//! command = "bin/send-email"
//! ```
//!
//! The command runs with the job described in its environment. Exit status
//! zero means the job succeeded.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::engine::Perform;
use crate::error::{Error, Result};
use crate::job::Job;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct HandlerFile {
    handler: Handler,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Handler {
    pub class: String,
    pub command: PathBuf,
}

/// Handlers indexed by job class.
#[derive(Debug, Default)]
pub struct HookRegistry {
    handlers: HashMap<String, Handler>,
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all `.toml` files from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::InvalidConfiguration(format!(
                "cannot read handlers dir {}: {e}",
                dir.display()
            ))
        })?;

        let mut registry = Self::empty();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: HandlerFile = toml::from_str(&content).map_err(|e| {
                    Error::InvalidConfiguration(format!(
                        "bad handler config {}: {e}",
                        path.display()
                    ))
                })?;
                registry.insert(file.handler);
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, handler: Handler) {
        self.handlers.insert(handler.class.clone(), handler);
    }

    pub fn get(&self, class: &str) -> Option<&Handler> {
        self.handlers.get(class)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl Perform for HookRegistry {
    async fn perform(&self, job: &Job) -> Result<()> {
        let handler = self.get(&job.payload.class).ok_or_else(|| {
            Error::JobExecution(format!("no handler for class {}", job.payload.class))
        })?;

        // Relative commands resolve against the process CWD.
        let command = if handler.command.is_relative() {
            std::env::current_dir()?.join(&handler.command)
        } else {
            handler.command.clone()
        };

        debug!(job = %job, command = %command.display(), "running hook");

        let status = Command::new(&command)
            .env("WORKQ_JOB_ID", job.id().to_string())
            .env("WORKQ_JOB_CLASS", &job.payload.class)
            .env("WORKQ_QUEUE", &job.queue)
            .env("WORKQ_JOB_ARGS", job.payload.args.to_string())
            .status()
            .await
            .map_err(|e| {
                Error::JobExecution(format!("cannot run {}: {e}", command.display()))
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::JobExecution(format!(
                "{} hook exited with status {}",
                job.payload.class,
                status.code().unwrap_or(-1)
            )))
        }
    }
}
