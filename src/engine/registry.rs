//! Worker registration in the store.
//!
//! Layout: set `workers` holds every live worker id; `worker:{id}:started`
//! holds the start time; `worker:{id}` holds the working-on snapshot.

use chrono::Utc;
use tracing::warn;

use crate::error::Result;
use crate::model::{WorkerId, WorkingOn};
use crate::stat;
use crate::store::Store;

pub const WORKERS_SET: &str = "workers";

pub(crate) fn working_on_key(id: &WorkerId) -> String {
    format!("worker:{id}")
}

fn started_key(id: &WorkerId) -> String {
    format!("worker:{id}:started")
}

pub async fn register(store: &dyn Store, id: &WorkerId) -> Result<()> {
    let id_str = id.to_string();
    store.add_to_set(WORKERS_SET, &id_str).await?;
    store
        .set_string(&started_key(id), &Utc::now().to_rfc3339())
        .await
}

/// Remove every trace of `id`: set membership, working-on record, start
/// time and its per-worker counters.
pub async fn unregister(store: &dyn Store, id: &WorkerId) -> Result<()> {
    store.remove_from_set(WORKERS_SET, &id.to_string()).await?;
    store.delete_key(&working_on_key(id)).await?;
    store.delete_key(&started_key(id)).await?;
    stat::clear(store, &format!("processed:{id}")).await?;
    stat::clear(store, &format!("failed:{id}")).await
}

pub async fn exists(store: &dyn Store, id: &WorkerId) -> Result<bool> {
    store.is_set_member(WORKERS_SET, &id.to_string()).await
}

/// Look up a registered worker by its store string.
pub async fn find(store: &dyn Store, raw: &str) -> Result<Option<WorkerId>> {
    if !store.is_set_member(WORKERS_SET, raw).await? {
        return Ok(None);
    }
    WorkerId::parse(raw).map(Some)
}

/// Every registered worker. Malformed entries are skipped.
pub async fn all(store: &dyn Store) -> Result<Vec<WorkerId>> {
    let members = store.list_set_members(WORKERS_SET).await?;
    Ok(members
        .iter()
        .filter_map(|raw| match WorkerId::parse(raw) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(worker = %raw, error = %e, "skipping malformed worker registration");
                None
            }
        })
        .collect())
}

/// When the worker registered, as recorded in the store.
pub async fn started_at(store: &dyn Store, id: &WorkerId) -> Result<Option<String>> {
    store.get_string(&started_key(id)).await
}

/// The job `id` is currently working on, if any.
pub async fn working_on(store: &dyn Store, id: &WorkerId) -> Result<Option<WorkingOn>> {
    match store.get_string(&working_on_key(id)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}
