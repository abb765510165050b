//! The shared key-value store the worker talks to.
//!
//! Every method is a single atomic operation against the backend. The worker
//! never holds a multi-step transaction open across a suspension point.

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Capability set consumed by the worker, the job model and the registry.
///
/// Queue payloads are opaque strings at this boundary (JSON in practice).
#[async_trait]
pub trait Store: Send + Sync {
    async fn add_to_set(&self, set: &str, member: &str) -> Result<()>;

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<()>;

    async fn is_set_member(&self, set: &str, member: &str) -> Result<bool>;

    async fn list_set_members(&self, set: &str) -> Result<Vec<String>>;

    /// Append a payload to the tail of a queue, making the queue known.
    async fn push_to_queue(&self, queue: &str, payload: &str) -> Result<()>;

    /// Pop the head of a queue. `None` when the queue is empty.
    async fn pop_from_queue(&self, queue: &str) -> Result<Option<String>>;

    /// Pop from the first non-empty queue in `queues`, waiting up to
    /// `timeout` for one to receive a payload.
    ///
    /// Returns `(queue, payload)`. A zero timeout makes exactly one attempt;
    /// it never means "wait forever".
    async fn blocking_pop_from_queue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>>;

    async fn queue_length(&self, queue: &str) -> Result<usize>;

    /// Every queue the store knows about, in no particular order.
    async fn list_queue_names(&self) -> Result<Vec<String>>;

    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    async fn delete_key(&self, key: &str) -> Result<()>;

    /// Atomically add `by` to the integer stored at `key` (missing = 0).
    async fn increment(&self, key: &str, by: i64) -> Result<i64>;
}
