//! External event-loop adapters for the timer facility.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{Callback, TimerId, run_callback};
use crate::error::{Error, Result};

/// Whether a delegated timer repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Recurring,
    Once,
}

/// An event loop that can own timers on the facility's behalf.
pub trait EventLoop: Send + Sync {
    fn add(&self, interval: Duration, mode: TimerMode, callback: Callback) -> TimerId;

    fn del(&self, id: &TimerId, mode: TimerMode) -> bool;

    fn clear_all_timers(&self);
}

/// Sub-second timers backed by tokio tasks, one task per timer.
pub struct TokioEventLoop {
    runtime: Handle,
    timers: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioEventLoop {
    /// Bind to the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidConfiguration("TokioEventLoop requires a tokio runtime".to_string())
        })?;
        Ok(Self::with_handle(runtime))
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventLoop for TokioEventLoop {
    fn add(&self, interval: Duration, mode: TimerMode, callback: Callback) -> TimerId {
        let id = TimerId::generate();
        let task_id = id.clone();
        let timers = Arc::clone(&self.timers);

        // Hold the map while spawning so a one-shot that fires immediately
        // cannot try to remove itself before it was inserted.
        let mut map = self.timers.lock();
        let handle = self.runtime.spawn(async move {
            match mode {
                TimerMode::Once => {
                    tokio::time::sleep(interval).await;
                    run_callback(&task_id, &callback);
                    timers.lock().remove(&task_id);
                }
                TimerMode::Recurring => {
                    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        run_callback(&task_id, &callback);
                    }
                }
            }
        });
        map.insert(id.clone(), handle);
        id
    }

    fn del(&self, id: &TimerId, _mode: TimerMode) -> bool {
        if let Some(handle) = self.timers.lock().remove(id) {
            handle.abort();
        }
        true
    }

    fn clear_all_timers(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}
