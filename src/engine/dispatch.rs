//! Process dispatcher: run each job in an isolated child process.
//!
//! The child performs the job and records its outcome itself (complete, or
//! failed with the job's error). The parent only waits: a clean exit means
//! the child already recorded the outcome, anything else is a dirty exit.
//! When no child can be spawned the job runs in-process instead, so a
//! transient spawn failure never loses the job.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt as _;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::job::Job;
use crate::model::JobStatus;
use crate::store::Store;

/// Environment variable carrying the serialized job into the child.
pub const JOB_ENV: &str = "WORKQ_JOB";

/// A job's own logic.
#[async_trait]
pub trait Perform: Send + Sync {
    async fn perform(&self, job: &Job) -> Result<()>;
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    /// Set when the child was terminated by a signal.
    pub signal: Option<i32>,
}

impl ChildExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A running child process that executes one job.
#[async_trait]
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the child to exit. Must be cancel-safe: the worker drops
    /// and re-creates this future whenever a control event arrives.
    async fn wait(&mut self) -> Result<ChildExit>;
}

/// Starts the isolated child for a job.
pub trait Spawner: Send + Sync {
    fn spawn(&self, job: &Job) -> Result<Box<dyn ChildProcess>>;
}

/// Spawns a program with the job serialized into [`JOB_ENV`].
///
/// The child leads its own process group, so whatever it starts in turn
/// (a hook script and its children) is killed along with it.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Re-run the current executable's `perform` subcommand.
    pub fn current_exe(handlers_dir: &Path) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("workq"));
        Self::new(
            program,
            vec![
                "perform".to_string(),
                "--handlers".to_string(),
                handlers_dir.display().to_string(),
            ],
        )
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, job: &Job) -> Result<Box<dyn ChildProcess>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(JOB_ENV, serde_json::to_string(job)?)
            .process_group(0)
            .spawn()?;
        debug!(program = %self.program.display(), pid = ?child.id(), "spawned child");
        Ok(Box::new(SpawnedChild(child)))
    }
}

struct SpawnedChild(tokio::process::Child);

#[async_trait]
impl ChildProcess for SpawnedChild {
    fn pid(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> Result<ChildExit> {
        Ok(self.0.wait().await?.into())
    }
}

/// The child side: perform the job and record the outcome.
///
/// A failure of the job's logic is recorded through [`Job::fail`] and is not
/// an error here. `Err` means the outcome could not be recorded.
pub async fn perform_job(store: &dyn Store, performer: &dyn Perform, job: &Job) -> Result<JobStatus> {
    match performer.perform(job).await {
        Ok(()) => {
            job.update_status(store, JobStatus::Complete).await?;
            info!(job = %job, "job has finished");
            Ok(JobStatus::Complete)
        }
        Err(e) => {
            error!(job = %job, error = %e, "job has failed");
            let failure = match e {
                Error::JobExecution(_) => e,
                other => Error::JobExecution(other.to_string()),
            };
            job.fail(store, &failure).await?;
            Ok(JobStatus::Failed)
        }
    }
}

/// Read the job handed to a `perform` child.
pub fn job_from_env() -> Result<Job> {
    let raw = std::env::var(JOB_ENV)
        .map_err(|_| Error::InvalidConfiguration(format!("{JOB_ENV} is not set")))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Whether `pid` names a live process (signal 0 check).
pub fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send SIGKILL to the process group led by `pid`, or to `pid` alone when
/// it leads no group.
pub fn kill_process(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| Error::Other(format!("pid {pid} out of range")))?;
    let pid = Pid::from_raw(raw);
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => kill(pid, Signal::SIGKILL).map_err(|e| Error::Io(e.into())),
        Err(e) => Err(Error::Io(e.into())),
    }
}
