//! Coarse software timers: one-shot and periodic callbacks.
//!
//! Tasks are bucketed by the whole second they are due in. A background
//! task ticks the schedule once a second while anything is pending; callers
//! may also tick cooperatively (the worker does, once per loop iteration).
//! Resolution is one second. Callers that need finer timing supply an
//! [`EventLoop`] adapter and the timer delegates to it entirely.
//!
//! Persistent tasks are re-armed from the time they fired, not from their
//! original schedule: under sustained overload intervals drift rather than
//! firing in catch-up bursts.

pub mod event_loop;

pub use event_loop::{EventLoop, TimerMode, TokioEventLoop};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

const ALARM_PERIOD: Duration = Duration::from_secs(1);

/// A timer callback. Arguments are whatever the closure captures.
pub type Callback = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Identifier of a scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(pub String);

impl TimerId {
    pub fn generate() -> Self {
        Self(format!("timer_{}", Uuid::new_v4().simple()))
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TimerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Source of "now" in whole unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to. For tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(whole_seconds(by), Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn whole_seconds(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

struct Task {
    id: TimerId,
    callback: Callback,
    persistent: bool,
    interval: Duration,
}

#[derive(Default)]
struct Schedule {
    tasks: BTreeMap<i64, Vec<Task>>,
    /// Running ticker and the generation it was armed under.
    alarm: Option<(u64, JoinHandle<()>)>,
    generation: u64,
}

impl Schedule {
    fn disarm(&mut self) {
        if let Some((_, handle)) = self.alarm.take() {
            handle.abort();
        }
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    event_loop: Option<Arc<dyn EventLoop>>,
    schedule: Mutex<Schedule>,
}

/// Timer facility. Cloning shares the same schedule.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<Inner>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Local schedule on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Local schedule on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::build(clock, None)
    }

    /// Delegate every operation to an external event loop.
    pub fn with_event_loop(event_loop: Arc<dyn EventLoop>) -> Self {
        Self::build(Arc::new(SystemClock), Some(event_loop))
    }

    fn build(clock: Arc<dyn Clock>, event_loop: Option<Arc<dyn EventLoop>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                event_loop,
                schedule: Mutex::new(Schedule::default()),
            }),
        }
    }

    /// Schedule `callback` to run `interval` from now, repeating when
    /// `persistent`. Returns the task id (the adapter's id when delegating).
    pub fn add(
        &self,
        interval: Duration,
        callback: Callback,
        persistent: bool,
        id: Option<TimerId>,
    ) -> Result<TimerId> {
        if interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "timer interval must be greater than zero".to_string(),
            ));
        }

        if let Some(event_loop) = &self.inner.event_loop {
            let mode = if persistent {
                TimerMode::Recurring
            } else {
                TimerMode::Once
            };
            return Ok(event_loop.add(interval, mode, callback));
        }

        let id = id.unwrap_or_else(TimerId::generate);
        self.schedule(Task {
            id: id.clone(),
            callback,
            persistent,
            interval,
        });
        Ok(id)
    }

    fn schedule(&self, task: Task) {
        let fire_at = self
            .inner
            .clock
            .now()
            .saturating_add(whole_seconds(task.interval));
        let mut schedule = self.inner.schedule.lock();
        schedule.tasks.entry(fire_at).or_default().push(task);
        self.arm(&mut schedule);
    }

    /// Start the once-a-second ticker unless one is already running.
    /// Without a tokio runtime the schedule is only advanced by `tick()`.
    fn arm(&self, schedule: &mut Schedule) {
        if schedule
            .alarm
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            schedule.alarm = None;
            return;
        };

        schedule.generation += 1;
        let generation = schedule.generation;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + ALARM_PERIOD, ALARM_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let timer = Timer { inner };
                timer.tick();
                let still_armed = timer
                    .inner
                    .schedule
                    .lock()
                    .alarm
                    .as_ref()
                    .is_some_and(|(g, _)| *g == generation);
                if !still_armed {
                    break;
                }
            }
        });
        debug!("timer alarm armed");
        schedule.alarm = Some((generation, handle));
    }

    /// Run every task due at or before now. Returns how many callbacks ran.
    pub fn tick(&self) -> usize {
        let now = self.inner.clock.now();
        let due = {
            let mut schedule = self.inner.schedule.lock();
            if schedule.tasks.is_empty() {
                schedule.disarm();
                return 0;
            }
            let later = schedule.tasks.split_off(&now.saturating_add(1));
            std::mem::replace(&mut schedule.tasks, later)
        };

        let mut fired = 0;
        for task in due.into_values().flatten() {
            fired += 1;
            run_callback(&task.id, &task.callback);
            if task.persistent {
                self.schedule(task);
            }
        }

        let mut schedule = self.inner.schedule.lock();
        if schedule.tasks.is_empty() {
            schedule.disarm();
        }
        fired
    }

    /// Remove every task with `id`. Always succeeds, found or not.
    pub fn del(&self, id: &TimerId) -> bool {
        if let Some(event_loop) = &self.inner.event_loop {
            return event_loop.del(id, TimerMode::Recurring);
        }

        let mut schedule = self.inner.schedule.lock();
        for tasks in schedule.tasks.values_mut() {
            tasks.retain(|task| &task.id != id);
        }
        schedule.tasks.retain(|_, tasks| !tasks.is_empty());
        if schedule.tasks.is_empty() {
            schedule.disarm();
        }
        true
    }

    /// Remove every task and stop the ticker.
    pub fn del_all(&self) {
        {
            let mut schedule = self.inner.schedule.lock();
            schedule.tasks.clear();
            schedule.disarm();
        }
        if let Some(event_loop) = &self.inner.event_loop {
            event_loop.clear_all_timers();
        }
    }

    /// Number of pending fire-second buckets (not tasks).
    pub fn count(&self) -> usize {
        self.inner.schedule.lock().tasks.len()
    }
}

/// Run one callback, reporting errors and panics instead of propagating them.
pub(crate) fn run_callback(id: &TimerId, callback: &Callback) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback()));
    let result = match outcome {
        Ok(Ok(())) => "ok",
        Ok(Err(e)) => {
            error!(timer = %id, error = %e, "timer callback failed");
            "error"
        }
        Err(_) => {
            error!(timer = %id, "timer callback panicked");
            "error"
        }
    };
    metrics::timer_callbacks().add(1, &[KeyValue::new("result", result)]);
}
