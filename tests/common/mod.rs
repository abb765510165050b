//! Shared fakes for worker tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use workq::engine::{ChildExit, ChildProcess, Perform, Spawner, WorkerOptions};
use workq::error::{Error, Result};
use workq::job::Job;
use workq::store::{MemoryStore, Store};

/// Options suitable for tests: no signal handlers, no statistics file.
pub fn test_options() -> WorkerOptions {
    WorkerOptions {
        install_signals: false,
        ..WorkerOptions::default()
    }
}

/// Performer that succeeds unless the job class is `Boom` (error) or
/// `Panic` (panics). Records every job it sees.
#[derive(Default)]
pub struct ScriptedPerformer {
    pub seen: Mutex<Vec<Job>>,
}

#[async_trait]
impl Perform for ScriptedPerformer {
    async fn perform(&self, job: &Job) -> Result<()> {
        self.seen.lock().push(job.clone());
        match job.payload.class.as_str() {
            "Boom" => Err(Error::JobExecution("boom".to_string())),
            "Panic" => panic!("job panicked"),
            _ => Ok(()),
        }
    }
}

/// How one fake child behaves.
pub enum FakeRun {
    /// Exit as soon as waited on.
    Exit(ChildExit),
    /// Exit when the test sends on the paired channel.
    Held {
        pid: u32,
        exit: oneshot::Receiver<ChildExit>,
    },
}

/// Spawner handing out scripted children, in order. Reports each spawned
/// job on `spawned`.
pub struct FakeSpawner {
    script: Mutex<VecDeque<FakeRun>>,
    spawned: mpsc::UnboundedSender<Job>,
}

impl FakeSpawner {
    pub fn new(script: Vec<FakeRun>) -> (Arc<Self>, mpsc::UnboundedReceiver<Job>) {
        let (spawned, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            script: Mutex::new(script.into()),
            spawned,
        });
        (spawner, rx)
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, job: &Job) -> Result<Box<dyn ChildProcess>> {
        let run = self
            .script
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Other("fake spawner script exhausted".to_string()))?;
        let _ = self.spawned.send(job.clone());
        Ok(match run {
            FakeRun::Exit(exit) => Box::new(FakeChild {
                pid: 1,
                exit: Some(Ok(exit)),
                held: None,
            }),
            FakeRun::Held { pid, exit } => Box::new(FakeChild {
                pid,
                exit: None,
                held: Some(exit),
            }),
        })
    }
}

struct FakeChild {
    pid: u32,
    exit: Option<Result<ChildExit>>,
    held: Option<oneshot::Receiver<ChildExit>>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Result<ChildExit> {
        if let Some(exit) = self.exit.take() {
            return exit;
        }
        match self.held.as_mut() {
            Some(rx) => {
                let exit = rx
                    .await
                    .map_err(|_| Error::Other("fake child abandoned".to_string()))?;
                self.held = None;
                Ok(exit)
            }
            None => Err(Error::Other("fake child already reaped".to_string())),
        }
    }
}

/// A pid no process can have.
pub const DEAD_PID: u32 = i32::MAX as u32;

/// A [`MemoryStore`] that remembers which queues were popped, in order.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    pub pops: Mutex<Vec<String>>,
}

#[async_trait]
impl Store for RecordingStore {
    async fn add_to_set(&self, set: &str, member: &str) -> Result<()> {
        self.inner.add_to_set(set, member).await
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<()> {
        self.inner.remove_from_set(set, member).await
    }

    async fn is_set_member(&self, set: &str, member: &str) -> Result<bool> {
        self.inner.is_set_member(set, member).await
    }

    async fn list_set_members(&self, set: &str) -> Result<Vec<String>> {
        self.inner.list_set_members(set).await
    }

    async fn push_to_queue(&self, queue: &str, payload: &str) -> Result<()> {
        self.inner.push_to_queue(queue, payload).await
    }

    async fn pop_from_queue(&self, queue: &str) -> Result<Option<String>> {
        self.pops.lock().push(queue.to_string());
        self.inner.pop_from_queue(queue).await
    }

    async fn blocking_pop_from_queue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        self.inner.blocking_pop_from_queue(queues, timeout).await
    }

    async fn queue_length(&self, queue: &str) -> Result<usize> {
        self.inner.queue_length(queue).await
    }

    async fn list_queue_names(&self) -> Result<Vec<String>> {
        self.inner.list_queue_names().await
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_string(key, value).await
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_string(key).await
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        self.inner.delete_key(key).await
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        self.inner.increment(key, by).await
    }
}
