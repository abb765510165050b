//! In-process store. Used by tests and single-process runs.

use super::Store;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    sets: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, VecDeque<String>>,
    known_queues: BTreeSet<String>,
    strings: HashMap<String, String>,
}

/// A [`Store`] held entirely in memory.
///
/// Cheap to share behind an `Arc`; all operations take a short lock.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop_any(&self, queues: &[String]) -> Option<(String, String)> {
        let mut state = self.state.lock();
        queues.iter().find_map(|queue| {
            state
                .queues
                .get_mut(queue)
                .and_then(VecDeque::pop_front)
                .map(|payload| (queue.clone(), payload))
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_to_set(&self, set: &str, member: &str) -> Result<()> {
        self.state
            .lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(members) = state.sets.get_mut(set) {
            members.remove(member);
            if members.is_empty() {
                state.sets.remove(set);
            }
        }
        Ok(())
    }

    async fn is_set_member(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .sets
            .get(set)
            .is_some_and(|members| members.contains(member)))
    }

    async fn list_set_members(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn push_to_queue(&self, queue: &str, payload: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.known_queues.insert(queue.to_string());
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(payload.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_from_queue(&self, queue: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .queues
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }

    async fn blocking_pop_from_queue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.try_pop_any(queues) {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn queue_length(&self, queue: &str) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0))
    }

    async fn list_queue_names(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().known_queues.iter().cloned().collect())
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().strings.get(key).cloned())
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.strings.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let mut state = self.state.lock();
        let current = match state.strings.get(key) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| Error::Other(format!("value at {key} is not an integer")))?,
            None => 0,
        };
        let next = current + by;
        state.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}
