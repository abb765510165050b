//! Jobs: enqueue, reserve, status tracking and failure recording.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    FailureKind, FailureRecord, JobId, JobPayload, JobStatus, MalformedRecord, StatusRecord,
    WorkerId,
};
use crate::stat;
use crate::store::Store;
use crate::telemetry::metrics;

/// Set of job ids that have a failure record.
pub const FAILED_SET: &str = "failed";

/// Set of keys holding payloads that were popped but could not be decoded.
pub const MALFORMED_SET: &str = "malformed";

/// A reserved unit of work. Owned by the worker between reservation and the
/// terminal status update.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub queue: String,
    pub payload: JobPayload,
    /// Set by the worker when it starts working on the job.
    #[serde(default, with = "worker_field")]
    pub worker: Option<WorkerId>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            queue: queue.into(),
            payload,
            worker: None,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.payload.id
    }

    /// Enqueue a new job and mark it waiting.
    pub async fn create(
        store: &dyn Store,
        queue: &str,
        class: &str,
        args: serde_json::Value,
    ) -> Result<JobId> {
        if queue.is_empty() || queue.contains(':') || queue.contains(',') || queue == "*" {
            return Err(Error::InvalidConfiguration(format!(
                "invalid queue name: {queue:?}"
            )));
        }
        let payload = JobPayload::new(class, args);
        let id = payload.id.clone();
        store
            .push_to_queue(queue, &serde_json::to_string(&payload)?)
            .await?;
        let job = Job::new(queue, payload);
        job.update_status(store, JobStatus::Waiting).await?;
        Ok(id)
    }

    /// Pop one job off `queue`.
    ///
    /// Payloads that do not decode are recorded with
    /// [`Job::record_malformed`] and skipped, so one bad entry never hides
    /// the jobs queued behind it.
    pub async fn reserve(store: &dyn Store, queue: &str) -> Result<Option<Job>> {
        while let Some(raw) = store.pop_from_queue(queue).await? {
            match serde_json::from_str(&raw) {
                Ok(payload) => return Ok(Some(Job::new(queue, payload))),
                Err(e) => Self::record_malformed(store, queue, &raw, &e).await?,
            }
        }
        Ok(None)
    }

    /// Pop one job from the first of `queues` that has one, waiting up to
    /// `timeout`. Malformed payloads are skipped as in [`Job::reserve`];
    /// the wait that follows one is bounded by what is left of `timeout`.
    pub async fn reserve_blocking(
        store: &dyn Store,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut remaining = timeout;
        while let Some((queue, raw)) = store.blocking_pop_from_queue(queues, remaining).await? {
            match serde_json::from_str(&raw) {
                Ok(payload) => return Ok(Some(Job::new(queue, payload))),
                Err(e) => Self::record_malformed(store, &queue, &raw, &e).await?,
            }
            remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        }
        Ok(None)
    }

    /// Keep a payload that was popped but could not be decoded.
    pub async fn record_malformed(
        store: &dyn Store,
        queue: &str,
        raw: &str,
        error: &serde_json::Error,
    ) -> Result<()> {
        warn!(queue, payload = raw, error = %error, "dropping malformed payload");
        let record = MalformedRecord {
            failed_at: Utc::now(),
            queue: queue.to_string(),
            payload: raw.to_string(),
            error: error.to_string(),
        };
        let key = format!("malformed:{}", Uuid::new_v4().simple());
        store.set_string(&key, &serde_json::to_string(&record)?).await?;
        store.add_to_set(MALFORMED_SET, &key).await?;
        metrics::job_failures().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("kind", "malformed"),
            ],
        );
        Ok(())
    }

    /// Every recorded malformed payload, in no particular order.
    pub async fn malformed(store: &dyn Store) -> Result<Vec<MalformedRecord>> {
        let mut records = Vec::new();
        for key in store.list_set_members(MALFORMED_SET).await? {
            if let Some(raw) = store.get_string(&key).await? {
                records.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(records)
    }

    pub async fn update_status(&self, store: &dyn Store, status: JobStatus) -> Result<()> {
        let record = StatusRecord {
            status,
            updated_at: Utc::now(),
        };
        store
            .set_string(&status_key(self.id()), &serde_json::to_string(&record)?)
            .await
    }

    /// Read the tracked status of a job.
    pub async fn status(store: &dyn Store, id: &JobId) -> Result<Option<JobStatus>> {
        let Some(raw) = store.get_string(&status_key(id)).await? else {
            return Ok(None);
        };
        let record: StatusRecord = serde_json::from_str(&raw)?;
        Ok(Some(record.status))
    }

    /// Record a failure: failure record, `failed` counters, status `Failed`.
    pub async fn fail(&self, store: &dyn Store, error: &Error) -> Result<()> {
        let kind = match error {
            Error::DirtyExit { .. } => FailureKind::DirtyExit,
            _ => FailureKind::JobExecution,
        };
        let worker = self.worker.as_ref().map(ToString::to_string);
        let record = FailureRecord {
            failed_at: Utc::now(),
            payload: self.payload.clone(),
            kind,
            error: error.to_string(),
            worker: worker.clone(),
            queue: self.queue.clone(),
        };

        metrics::job_failures().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new(
                    "kind",
                    match kind {
                        FailureKind::JobExecution => "job_execution",
                        FailureKind::DirtyExit => "dirty_exit",
                    },
                ),
            ],
        );

        store
            .set_string(&failure_key(self.id()), &serde_json::to_string(&record)?)
            .await?;
        store.add_to_set(FAILED_SET, &self.id().0).await?;
        stat::incr(store, "failed").await?;
        if let Some(worker) = worker {
            stat::incr(store, &format!("failed:{worker}")).await?;
        }
        self.update_status(store, JobStatus::Failed).await
    }

    /// Read the failure record of a job, if any.
    pub async fn failure(store: &dyn Store, id: &JobId) -> Result<Option<FailureRecord>> {
        match store.get_string(&failure_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(Job{{{}}} | ID: {} | {})",
            self.queue, self.payload.id, self.payload.class
        )
    }
}

fn status_key(id: &JobId) -> String {
    format!("job:{id}:status")
}

fn failure_key(id: &JobId) -> String {
    format!("failed:{id}")
}

/// Serialize the worker as its store string so a job can cross the process
/// boundary to the `perform` child.
mod worker_field {
    use super::WorkerId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        worker: &Option<WorkerId>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match worker {
            Some(id) => serializer.serialize_some(&id.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<WorkerId>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(raw) => WorkerId::parse(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
