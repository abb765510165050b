//! Postgres-backed store via direct SQLx.
//!
//! Strings, sets and queues live in plain tables (see `migrations/`).
//! Pops use `FOR UPDATE SKIP LOCKED` so concurrent workers never receive the
//! same payload; pushes `NOTIFY workq_push` to wake blocking pops.

use super::Store;
use crate::error::{Error, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::time::Duration;
use tracing::warn;

const PUSH_CHANNEL: &str = "workq_push";

/// Store handle. Owns the connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn try_pop_any(&self, queues: &[String]) -> Result<Option<(String, String)>> {
        for queue in queues {
            if let Some(payload) = self.pop_from_queue(queue).await? {
                return Ok(Some((queue.clone(), payload)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn add_to_set(&self, set: &str, member: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO workq_sets (name, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(set)
        .bind(member)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<()> {
        sqlx::query("DELETE FROM workq_sets WHERE name = $1 AND member = $2")
            .bind(set)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_set_member(&self, set: &str, member: &str) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM workq_sets WHERE name = $1 AND member = $2)",
        )
        .bind(set)
        .bind(member)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn list_set_members(&self, set: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT member FROM workq_sets WHERE name = $1 ORDER BY member")
                .bind(set)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(member,)| member).collect())
    }

    async fn push_to_queue(&self, queue: &str, payload: &str) -> Result<()> {
        sqlx::query("INSERT INTO workq_queues (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO workq_queue_items (queue, payload) VALUES ($1, $2)")
            .bind(queue)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(PUSH_CHANNEL)
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_from_queue(&self, queue: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "DELETE FROM workq_queue_items
             WHERE id = (
                 SELECT id FROM workq_queue_items
                 WHERE queue = $1
                 ORDER BY id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING payload",
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(payload,)| payload))
    }

    async fn blocking_pop_from_queue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;

        // Listen before the first attempt so a push in between still wakes us.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(PUSH_CHANNEL).await?;

        loop {
            if let Some(hit) = self.try_pop_any(queues).await? {
                return Ok(Some(hit));
            }
            match tokio::time::timeout_at(deadline, listener.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(notification)) => {
                    if !queues.iter().any(|q| q == notification.payload()) {
                        continue;
                    }
                }
                Ok(Err(e)) => {
                    warn!("PgListener error: {e}, falling back to a final poll");
                    return self.try_pop_any(queues).await;
                }
            }
        }
    }

    async fn queue_length(&self, queue: &str) -> Result<usize> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workq_queue_items WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(row.0).unwrap_or(0))
    }

    async fn list_queue_names(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM workq_queues")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO workq_strings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM workq_strings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM workq_strings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM workq_sets WHERE name = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let row: (String,) = sqlx::query_as(
            "INSERT INTO workq_strings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE
                 SET value = (workq_strings.value::bigint + $3)::text
             RETURNING value",
        )
        .bind(key)
        .bind(by.to_string())
        .bind(by)
        .fetch_one(&self.pool)
        .await?;
        row.0
            .parse()
            .map_err(|_| Error::Other(format!("value at {key} is not an integer")))
    }
}
