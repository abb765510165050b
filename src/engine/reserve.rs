//! Queue reservation: wildcard resolution plus polling or blocking pops.

use opentelemetry::KeyValue;
use std::time::Duration;
use tracing::info;

use crate::error::Result;
use crate::job::Job;
use crate::store::Store;
use crate::telemetry::metrics;

/// Queue-list sentinel meaning "every queue the store knows about".
pub const WILDCARD: &str = "*";

/// Resolve the configured queue list against the store.
///
/// Explicit names keep their position. The wildcard expands in place to the
/// store's remaining queues in alphabetical order. A list without the
/// wildcard is returned as is, without touching the store.
pub async fn resolve_queues(store: &dyn Store, configured: &[String]) -> Result<Vec<String>> {
    if !configured.iter().any(|q| q == WILDCARD) {
        return Ok(configured.to_vec());
    }

    let mut known = store.list_queue_names().await?;
    known.sort();
    known.dedup();

    let mut resolved: Vec<String> = Vec::with_capacity(known.len());
    for queue in configured {
        if queue == WILDCARD {
            for name in &known {
                if !configured.contains(name) && !resolved.contains(name) {
                    resolved.push(name.clone());
                }
            }
        } else if !resolved.contains(queue) {
            resolved.push(queue.clone());
        }
    }
    Ok(resolved)
}

/// Try to reserve one job from `queues`.
///
/// Polling mode checks each queue in order and takes the first job found.
/// Blocking mode issues one blocking pop across all queues, bounded by
/// `timeout`. "No job" is `Ok(None)`, never an error.
pub async fn reserve(
    store: &dyn Store,
    queues: &[String],
    blocking: bool,
    timeout: Duration,
) -> Result<Option<Job>> {
    if queues.is_empty() {
        return Ok(None);
    }

    let job = if blocking {
        Job::reserve_blocking(store, queues, timeout).await?
    } else {
        let mut found = None;
        for queue in queues {
            info!(queue = %queue, "checking queue for jobs");
            if let Some(job) = Job::reserve(store, queue).await? {
                found = Some(job);
                break;
            }
        }
        found
    };

    if let Some(job) = &job {
        info!(queue = %job.queue, "found job on queue");
    }
    metrics::reservations().add(
        1,
        &[
            KeyValue::new("mode", if blocking { "blocking" } else { "polling" }),
            KeyValue::new("result", if job.is_some() { "hit" } else { "empty" }),
        ],
    );
    Ok(job)
}
