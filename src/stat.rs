//! Persisted statistics counters (`processed`, `failed`, per-worker variants).

use crate::error::Result;
use crate::store::Store;

fn key(name: &str) -> String {
    format!("stat:{name}")
}

/// Current value of a counter; missing counters read as zero.
pub async fn get(store: &dyn Store, name: &str) -> Result<i64> {
    Ok(store
        .get_string(&key(name))
        .await?
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0))
}

pub async fn incr(store: &dyn Store, name: &str) -> Result<i64> {
    incr_by(store, name, 1).await
}

pub async fn incr_by(store: &dyn Store, name: &str, by: i64) -> Result<i64> {
    store.increment(&key(name), by).await
}

pub async fn clear(store: &dyn Store, name: &str) -> Result<()> {
    store.delete_key(&key(name)).await
}
