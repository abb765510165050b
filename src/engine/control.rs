//! Control plane: control events, the handle that sends them, and the OS
//! signal listener that turns signals into events.
//!
//! Signals never mutate worker state directly. They enqueue a [`Control`]
//! that the worker applies at its next checkpoint (loop top, idle sleep, or
//! while waiting on a child). A blocking reservation is not interrupted.

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;

/// A request to change the worker's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Stop after the current job finishes.
    Shutdown,
    /// Stop now, killing the active child.
    ShutdownNow,
    /// Stop reserving new jobs.
    Pause,
    /// Resume reserving jobs.
    Resume,
    /// Kill the active child but keep working.
    KillChild,
    /// Append a status line to the statistics file.
    WriteStatistics,
}

/// Signal → control event table.
pub const SIGNAL_MAP: [(Signal, Control); 6] = [
    (Signal::SIGTERM, Control::ShutdownNow),
    (Signal::SIGINT, Control::ShutdownNow),
    (Signal::SIGQUIT, Control::Shutdown),
    (Signal::SIGUSR1, Control::Pause),
    (Signal::SIGCONT, Control::Resume),
    (Signal::SIGUSR2, Control::WriteStatistics),
];

/// The control event a signal maps to, if the worker handles it.
pub fn control_for_signal(sig: Signal) -> Option<Control> {
    SIGNAL_MAP
        .iter()
        .find(|(s, _)| *s == sig)
        .map(|(_, control)| *control)
}

/// Cloneable sender of control events to one worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl WorkerHandle {
    /// Queue an event. Returns `false` once the worker is gone.
    pub fn send(&self, control: Control) -> bool {
        self.tx.send(control).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.send(Control::Shutdown)
    }

    pub fn shutdown_now(&self) -> bool {
        self.send(Control::ShutdownNow)
    }

    pub fn pause(&self) -> bool {
        self.send(Control::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(Control::Resume)
    }

    pub fn kill_child(&self) -> bool {
        self.send(Control::KillChild)
    }

    pub fn write_statistics(&self) -> bool {
        self.send(Control::WriteStatistics)
    }
}

pub(crate) fn channel() -> (WorkerHandle, mpsc::UnboundedReceiver<Control>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkerHandle { tx }, rx)
}

/// Listens for the signals in [`SIGNAL_MAP`]. Stops listening on drop.
pub struct SignalListener {
    tasks: Vec<JoinHandle<()>>,
}

impl SignalListener {
    /// Install handlers for every mapped signal, forwarding to `handle`.
    pub fn install(handle: WorkerHandle) -> Result<Self> {
        let mut tasks = Vec::with_capacity(SIGNAL_MAP.len());
        for (sig, control) in SIGNAL_MAP {
            let mut stream = signal(SignalKind::from_raw(sig as i32))?;
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    info!(signal = sig.as_str(), ?control, "signal received");
                    if !handle.send(control) {
                        break;
                    }
                }
            }));
        }
        debug!("registered signals");
        Ok(Self { tasks })
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
