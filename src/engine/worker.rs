//! The worker: register, reserve, dispatch, repeat.
//!
//! One worker processes one job at a time. Each loop iteration applies
//! pending control events, ticks the timer facility, then tries to reserve
//! a job. A reserved job runs in a child process (see [`super::dispatch`])
//! while the worker waits and stays responsive to control events.

use chrono::Utc;
use futures::FutureExt as _;
use opentelemetry::KeyValue;
use std::io::Write as _;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};

use super::control::{self, Control, SignalListener, WorkerHandle};
use super::dispatch::{
    ChildExit, CommandSpawner, Perform, Spawner, kill_process, perform_job, process_exists,
};
use super::events::{NoEvents, WorkerEvents};
use super::registry::{self, working_on_key};
use super::reserve::{self, resolve_queues};
use super::{log_store_error, reaper};
use crate::error::{Error, Result};
use crate::job::Job;
use crate::model::{JobStatus, WorkerId, WorkingOn};
use crate::stat;
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_job_span, worker_span};
use crate::timer::Timer;

/// Label written in the statistics type column.
pub const WORKER_TYPE: &str = "Worker";

/// Directory the default child process loads hooks from.
pub const DEFAULT_HANDLERS_DIR: &str = "handlers";

/// Tunables that do not change the worker's identity.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Use one blocking pop per iteration instead of polling each queue.
    pub blocking: bool,
    /// Size of the worker group this worker belongs to.
    pub group_count: u32,
    /// This worker's index within its group.
    pub group_index: u32,
    /// Where [`Worker::write_statistics`] appends. `None` disables it.
    pub statistics_file: Option<PathBuf>,
    /// Listen for OS signals while working.
    pub install_signals: bool,
    /// Process name fragment identifying worker processes for the reaper.
    pub process_marker: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            blocking: false,
            group_count: 1,
            group_index: 0,
            statistics_file: None,
            install_signals: true,
            process_marker: reaper::default_marker(),
        }
    }
}

impl WorkerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.group_count == 0 {
            return Err(Error::InvalidConfiguration(
                "group count must be at least 1".to_string(),
            ));
        }
        if self.group_index >= self.group_count {
            return Err(Error::InvalidConfiguration(format!(
                "group index {} out of range for group of {}",
                self.group_index, self.group_count
            )));
        }
        Ok(())
    }
}

enum Wake {
    Exited(Result<ChildExit>),
    Control(Option<Control>),
}

pub struct Worker {
    id: WorkerId,
    owner_pid: u32,
    store: Arc<dyn Store>,
    performer: Arc<dyn Perform>,
    spawner: Option<Arc<dyn Spawner>>,
    events: Arc<dyn WorkerEvents>,
    timer: Timer,
    options: WorkerOptions,
    interval: Duration,
    paused: bool,
    shutting_down: bool,
    child_pid: Option<u32>,
    current_job: Option<Job>,
    loop_count: u64,
    job_count: u64,
    handle: WorkerHandle,
    control: mpsc::UnboundedReceiver<Control>,
}

impl Worker {
    /// A worker for `queues` on this host and process. `"*"` in the list
    /// stands for every queue the store knows about.
    pub fn new(queues: Vec<String>, store: Arc<dyn Store>, performer: Arc<dyn Perform>) -> Self {
        let (handle, control) = control::channel();
        Self {
            id: WorkerId::local(queues),
            owner_pid: std::process::id(),
            store,
            performer,
            spawner: Some(Arc::new(CommandSpawner::current_exe(Path::new(
                DEFAULT_HANDLERS_DIR,
            )))),
            events: Arc::new(NoEvents),
            timer: Timer::new(),
            options: WorkerOptions::default(),
            interval: Duration::from_secs(5),
            paused: false,
            shutting_down: false,
            child_pid: None,
            current_job: None,
            loop_count: 0,
            job_count: 0,
            handle,
            control,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Run every job in this process, without isolation.
    pub fn in_process(mut self) -> Self {
        self.spawner = None;
        self
    }

    pub fn with_performer(mut self, performer: Arc<dyn Perform>) -> Self {
        self.performer = performer;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn WorkerEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_timer(mut self, timer: Timer) -> Self {
        self.timer = timer;
        self
    }

    pub fn set_options(&mut self, options: WorkerOptions) -> Result<()> {
        options.validate()?;
        self.options = options;
        Ok(())
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// A sender for control events, usable from other tasks.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    pub fn job_count(&self) -> u64 {
        self.job_count
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    pub fn current_job(&self) -> Option<&Job> {
        self.current_job.as_ref()
    }

    /// The queue list with any wildcard resolved against the store.
    pub async fn queues(&self) -> Result<Vec<String>> {
        resolve_queues(&*self.store, &self.id.queues).await
    }

    /// The job this worker is recorded as working on.
    pub async fn job(&self) -> Result<Option<WorkingOn>> {
        registry::working_on(&*self.store, &self.id).await
    }

    /// A per-worker counter, e.g. `processed` or `failed`.
    pub async fn get_stat(&self, name: &str) -> Result<i64> {
        stat::get(&*self.store, &format!("{name}:{}", self.id)).await
    }

    /// Finish the current job, then stop.
    pub fn shutdown(&mut self) {
        info!("exiting");
        self.shutting_down = true;
    }

    /// Stop immediately, killing the active child.
    pub fn shutdown_now(&mut self) {
        info!("forcing shutdown");
        self.shutdown();
        self.kill_child();
    }

    pub fn pause_processing(&mut self) {
        info!("pausing job processing");
        self.paused = true;
    }

    pub fn unpause_processing(&mut self) {
        info!("resuming job processing");
        self.paused = false;
    }

    /// Kill the active child. If the recorded child is already gone the
    /// worker is in an unexpected state and shuts down.
    pub fn kill_child(&mut self) {
        let Some(pid) = self.child_pid else {
            debug!("no child to kill");
            return;
        };
        info!(child = pid, "killing child");
        if process_exists(pid) {
            debug!(child = pid, "child found, killing");
            if let Err(e) = kill_process(pid) {
                warn!(child = pid, error = %e, "failed to kill child");
            }
            self.child_pid = None;
        } else {
            info!(child = pid, "child not found, shutting down");
            self.shutdown();
        }
    }

    /// One fixed-width status line.
    pub fn statistics_line(&self) -> String {
        let queues = self.id.queues.join(",");
        let state = if self.current_job.is_some() {
            "[busy]"
        } else {
            "[idle]"
        };
        format!(
            "{:<10}{:<8}{:<type_width$}{:<queue_width$}{:<8}{:<13}{:<13}{:<6}\n",
            self.id.pid,
            format!("{:.2}M", memory_mb()),
            WORKER_TYPE,
            queues,
            self.timer.count(),
            self.loop_count,
            self.job_count,
            state,
            type_width = WORKER_TYPE.len().max(15) + 1,
            queue_width = queues.len().max(23) + 1,
        )
    }

    /// Append [`Self::statistics_line`] to the statistics file.
    pub fn write_statistics(&self) -> Result<()> {
        let Some(path) = &self.options.statistics_file else {
            warn!("no statistics file configured");
            return Ok(());
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(self.statistics_line().as_bytes())?;
        Ok(())
    }

    /// Process jobs until shut down.
    ///
    /// With a zero `interval` the worker drains its queues and returns as
    /// soon as a reservation comes back empty. Otherwise it sleeps for
    /// `interval` between empty polls (blocking mode waits up to `interval`
    /// inside the pop instead).
    ///
    /// The worker unregisters on return, on error and on panic. If the
    /// returned future is dropped instead, unregistration is spawned onto
    /// the current runtime; an in-flight job is then left as it was.
    pub async fn work(&mut self, interval: Duration) -> Result<()> {
        if self.id.queues.is_empty() {
            return Err(Error::InvalidConfiguration(
                "worker needs at least one queue".to_string(),
            ));
        }
        self.interval = interval;
        let span = worker_span(&self.id);
        let mut cancelled = UnregisterOnDrop {
            store: self.store.clone(),
            id: self.id.clone(),
            owner_pid: self.owner_pid,
            armed: true,
        };

        async move {
            let listener = self.startup().await;
            let outcome = AssertUnwindSafe(self.run()).catch_unwind().await;
            drop(listener);
            self.unregister().await;
            cancelled.armed = false;
            if let Err(panic) = outcome {
                std::panic::resume_unwind(panic);
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn startup(&mut self) -> Option<SignalListener> {
        let listener = if self.options.install_signals {
            match SignalListener::install(self.handle.clone()) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!(error = %e, "could not install signal handlers");
                    None
                }
            }
        } else {
            None
        };

        let live = reaper::live_worker_pids(&self.options.process_marker);
        if let Err(e) = reaper::prune_dead_workers(&*self.store, &self.id, &live).await {
            warn!(error = %e, "failed to prune dead workers");
        }

        info!(
            worker = %self.id,
            interval = ?self.interval,
            blocking = self.options.blocking,
            group_count = self.options.group_count,
            group_index = self.options.group_index,
            "worker started"
        );
        log_store_error(
            "registering worker",
            registry::register(&*self.store, &self.id).await,
        );
        self.events.worker_started(&self.id).await;
        listener
    }

    async fn run(&mut self) {
        loop {
            while let Ok(control) = self.control.try_recv() {
                self.apply(control);
            }
            if self.shutting_down {
                break;
            }

            self.timer.tick();
            self.loop_count += 1;

            let job = if self.paused {
                None
            } else {
                self.reserve().await
            };

            let Some(job) = job else {
                if self.interval.is_zero() {
                    break;
                }
                if !self.options.blocking || self.paused {
                    let status = if self.paused { "paused" } else { "waiting" };
                    debug!(interval = ?self.interval, status, "sleeping");
                    self.idle().await;
                }
                continue;
            };

            self.process(job).await;
        }
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::Shutdown => self.shutdown(),
            Control::ShutdownNow => self.shutdown_now(),
            Control::Pause => self.pause_processing(),
            Control::Resume => self.unpause_processing(),
            Control::KillChild => self.kill_child(),
            Control::WriteStatistics => {
                if let Err(e) = self.write_statistics() {
                    error!(error = %e, "failed to write statistics");
                }
            }
        }
    }

    /// Sleep for one interval, waking early for a control event.
    async fn idle(&mut self) {
        let control = tokio::select! {
            _ = tokio::time::sleep(self.interval) => None,
            control = self.control.recv() => control,
        };
        if let Some(control) = control {
            self.apply(control);
        }
    }

    async fn reserve(&self) -> Option<Job> {
        let queues = match resolve_queues(&*self.store, &self.id.queues).await {
            Ok(queues) => queues,
            Err(e) => {
                warn!(error = %e, "failed to resolve queues");
                return None;
            }
        };
        if self.options.blocking {
            debug!(timeout = ?self.interval, "starting blocking reservation");
        }
        match reserve::reserve(&*self.store, &queues, self.options.blocking, self.interval).await
        {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "reservation failed");
                None
            }
        }
    }

    async fn process(&mut self, mut job: Job) {
        let span = start_job_span(&job);
        span.in_scope(|| info!(job = %job, "got job"));
        self.job_count += 1;

        self.working_on(&mut job).await;
        record_state_transition(&span, "waiting", "running");

        self.dispatch(&job).instrument(span.clone()).await;

        self.done_working(&job).await;
        record_state_transition(&span, "running", "done");
    }

    async fn working_on(&mut self, job: &mut Job) {
        job.worker = Some(self.id.clone());
        self.current_job = Some(job.clone());

        log_store_error(
            "marking job running",
            job.update_status(&*self.store, JobStatus::Running).await,
        );
        let snapshot = WorkingOn {
            queue: job.queue.clone(),
            run_at: Utc::now(),
            payload: job.payload.clone(),
        };
        let result = match serde_json::to_string(&snapshot) {
            Ok(raw) => self.store.set_string(&working_on_key(&self.id), &raw).await,
            Err(e) => Err(e.into()),
        };
        log_store_error("recording working-on snapshot", result);
    }

    async fn dispatch(&mut self, job: &Job) {
        self.events.before_dispatch(job).await;
        let spawned = match &self.spawner {
            Some(spawner) => spawner.spawn(job),
            None => Err(Error::Other("process isolation disabled".to_string())),
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                info!(error = %e, "processing job in-process");
                self.events.before_perform(job).await;
                if let Err(e) = perform_job(&*self.store, &*self.performer, job).await {
                    error!(job = %job, error = %e, "failed to record job outcome");
                }
                return;
            }
        };

        self.child_pid = child.pid();
        info!(child = ?self.child_pid, "forked child");

        let exit = loop {
            let wake = tokio::select! {
                exit = child.wait() => Wake::Exited(exit),
                control = self.control.recv() => Wake::Control(control),
            };
            match wake {
                Wake::Exited(exit) => break exit,
                Wake::Control(Some(control)) => self.apply(control),
                Wake::Control(None) => break child.wait().await,
            }
        };
        self.child_pid = None;

        let dirty = match exit {
            Ok(exit) if exit.is_clean() => {
                debug!(job = %job, "child exited cleanly");
                return;
            }
            Ok(exit) => Error::DirtyExit {
                code: exit.code,
                signal: exit.signal,
            },
            Err(e) => {
                error!(error = %e, "lost track of child");
                Error::DirtyExit {
                    code: None,
                    signal: None,
                }
            }
        };
        warn!(job = %job, error = %dirty, "child exited dirty");
        log_store_error("recording dirty exit", job.fail(&*self.store, &dirty).await);
    }

    async fn done_working(&mut self, job: &Job) {
        self.current_job = None;
        log_store_error("counting processed", stat::incr(&*self.store, "processed").await.map(drop));
        log_store_error(
            "counting processed for worker",
            stat::incr(&*self.store, &format!("processed:{}", self.id))
                .await
                .map(drop),
        );
        log_store_error(
            "clearing working-on snapshot",
            self.store.delete_key(&working_on_key(&self.id)).await,
        );
        metrics::jobs_processed().add(1, &[KeyValue::new("queue", job.queue.clone())]);
    }

    /// Unregister, failing any job still in flight as a dirty exit. Only
    /// the process that created the worker does this.
    async fn unregister(&mut self) {
        if std::process::id() != self.owner_pid {
            return;
        }
        if let Some(job) = self.current_job.take() {
            warn!(job = %job, "job still in flight at shutdown");
            let dirty = Error::DirtyExit {
                code: None,
                signal: None,
            };
            log_store_error("failing in-flight job", job.fail(&*self.store, &dirty).await);
        }
        self.events.worker_stopping(&self.id).await;
        log_store_error(
            "unregistering worker",
            registry::unregister(&*self.store, &self.id).await,
        );
        info!(worker = %self.id, "worker stopped");
    }
}

/// Unregisters a worker whose `work` future was dropped mid-run.
struct UnregisterOnDrop {
    store: Arc<dyn Store>,
    id: WorkerId,
    owner_pid: u32,
    armed: bool,
}

impl Drop for UnregisterOnDrop {
    fn drop(&mut self) {
        if !self.armed || std::process::id() != self.owner_pid {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(worker = %self.id, "work cancelled outside a runtime, worker stays registered");
            return;
        };
        warn!(worker = %self.id, "work cancelled, unregistering");
        let store = self.store.clone();
        let id = self.id.clone();
        runtime.spawn(async move {
            log_store_error("unregistering worker", registry::unregister(&*store, &id).await);
        });
    }
}

/// Resident memory of this process in MiB.
fn memory_mb() -> f64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );
    system
        .process(pid)
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}
