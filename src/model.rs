//! Core data model.
//!
//! A job is a unit of work sitting on a named queue. A worker is identified
//! by the host it runs on, its process id and the queues it serves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Structured worker identity.
///
/// Serialized as `host:pid:queue1,queue2` only at the store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub hostname: String,
    pub pid: u32,
    pub queues: Vec<String>,
}

impl WorkerId {
    pub fn new(hostname: impl Into<String>, pid: u32, queues: Vec<String>) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            queues,
        }
    }

    /// Identity of the calling process serving `queues`.
    pub fn local(queues: Vec<String>) -> Self {
        Self::new(local_hostname(), std::process::id(), queues)
    }

    /// Parse the store representation. Queue names may not contain `:`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, ':');
        let (Some(hostname), Some(pid), Some(queues)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidConfiguration(format!(
                "malformed worker id: {raw}"
            )));
        };
        let pid = pid
            .parse()
            .map_err(|_| Error::InvalidConfiguration(format!("bad pid in worker id: {raw}")))?;
        let queues = if queues.is_empty() {
            Vec::new()
        } else {
            queues.split(',').map(str::to_string).collect()
        };
        Ok(Self::new(hostname, pid, queues))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.pid, self.queues.join(","))
    }
}

/// Hostname of this machine, or `localhost` when it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

// ---------------------------------------------------------------------------
// Job payload
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What gets pushed onto a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: JobId,
    /// Names the handler that performs the job.
    pub class: String,
    /// Arbitrary arguments. The worker doesn't interpret these.
    #[serde(default)]
    pub args: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

impl JobPayload {
    pub fn new(class: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            class: class.into(),
            args,
            queued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Tracked status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, not yet reserved.
    Waiting,
    /// Reserved by a worker and dispatched.
    Running,
    /// Terminal: the job failed or its process exited dirty.
    Failed,
    /// Terminal: perform returned normally.
    Complete,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Complete)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Status value persisted at `job:{id}:status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Worker records
// ---------------------------------------------------------------------------

/// Snapshot persisted under the worker's key while it runs a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingOn {
    pub queue: String,
    pub run_at: DateTime<Utc>,
    pub payload: JobPayload,
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    JobExecution,
    DirtyExit,
}

/// Failure record persisted at `failed:{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failed_at: DateTime<Utc>,
    pub payload: JobPayload,
    pub kind: FailureKind,
    pub error: String,
    pub worker: Option<String>,
    pub queue: String,
}

/// A queue payload that could not be decoded, persisted at
/// `malformed:{id}` after it was popped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalformedRecord {
    pub failed_at: DateTime<Utc>,
    pub queue: String,
    /// The raw payload exactly as it was popped.
    pub payload: String,
    pub error: String,
}
