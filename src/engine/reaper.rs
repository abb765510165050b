//! Dead-worker reaper.
//!
//! A worker killed without a chance to unregister leaves its id in the
//! store. At startup each worker removes registrations that claim to live on
//! this host but whose pid is not a running worker process.

use std::collections::HashSet;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::info;

use super::registry;
use crate::error::Result;
use crate::model::WorkerId;
use crate::store::Store;
use crate::telemetry::metrics;

/// Pids of local processes whose name or command line contains `marker`.
pub fn live_worker_pids(marker: &str) -> HashSet<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
    );
    system
        .processes()
        .iter()
        .filter(|(_, process)| {
            process.name().to_string_lossy().contains(marker)
                || process
                    .cmd()
                    .iter()
                    .any(|arg| arg.to_string_lossy().contains(marker))
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Marker used to recognise worker processes: the running executable's name.
pub fn default_marker() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "workq".to_string())
}

/// Unregister every worker on `local`'s host whose pid is neither in
/// `live_pids` nor `local`'s own. Returns the pruned ids.
pub async fn prune_dead_workers(
    store: &dyn Store,
    local: &WorkerId,
    live_pids: &HashSet<u32>,
) -> Result<Vec<WorkerId>> {
    let mut pruned = Vec::new();
    for worker in registry::all(store).await? {
        if worker.hostname != local.hostname
            || live_pids.contains(&worker.pid)
            || worker.pid == local.pid
        {
            continue;
        }
        info!(worker = %worker, "pruning dead worker");
        registry::unregister(store, &worker).await?;
        metrics::workers_pruned().add(1, &[]);
        pruned.push(worker);
    }
    Ok(pruned)
}
