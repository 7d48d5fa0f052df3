//! PostgreSQL broker over the `job_queue` table.
//!
//! Claims use `SELECT … FOR UPDATE SKIP LOCKED` so concurrent workers never
//! lease the same row. A row whose lease has lapsed is claimable again.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::error::CoreError;
use conveyor_core::types::{JobId, Timestamp};
use sqlx::{FromRow, PgPool};

use super::{Broker, Delivery, QueueMessage, DEFAULT_LEASE};

/// How often an idle `dequeue` re-polls the table.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, FromRow)]
struct QueueRow {
    job_id: JobId,
    type_name: String,
    input: serde_json::Value,
    enqueued_at: Timestamp,
    attempts: i32,
    leased_by: Option<String>,
    lease_expires_at: Option<Timestamp>,
}

impl QueueRow {
    fn into_delivery(self, worker_id: &str) -> Delivery {
        Delivery {
            message: QueueMessage {
                job_id: self.job_id,
                type_name: self.type_name,
                input: self.input,
                enqueued_at: self.enqueued_at,
            },
            worker_id: self.leased_by.unwrap_or_else(|| worker_id.to_string()),
            attempt: u32::try_from(self.attempts).unwrap_or(1),
            lease_expires_at: self.lease_expires_at.unwrap_or_else(chrono::Utc::now),
        }
    }
}

fn broker_error(err: sqlx::Error) -> CoreError {
    tracing::error!(error = %err, "Job queue query failed");
    CoreError::BrokerUnavailable(err.to_string())
}

/// Broker backed by the `job_queue` table.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
    lease: Duration,
    poll_interval: Duration,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Atomically lease the oldest claimable row, if any.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Delivery>, CoreError> {
        let row = sqlx::query_as::<_, QueueRow>(
            "UPDATE job_queue \
             SET leased_by = $1, \
                 lease_expires_at = NOW() + make_interval(secs => $2), \
                 attempts = attempts + 1 \
             WHERE job_id = ( \
                 SELECT job_id FROM job_queue \
                 WHERE lease_expires_at IS NULL OR lease_expires_at <= NOW() \
                 ORDER BY enqueued_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING job_id, type_name, input, enqueued_at, attempts, leased_by, lease_expires_at",
        )
        .bind(worker_id)
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(broker_error)?;

        Ok(row.map(|r| r.into_delivery(worker_id)))
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO job_queue (job_id, type_name, input, enqueued_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(message.job_id)
        .bind(&message.type_name)
        .bind(&message.input)
        .bind(message.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;
        Ok(())
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, CoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.claim_next(worker_id).await? {
                if delivery.is_redelivery() {
                    tracing::warn!(
                        job_id = %delivery.job_id(),
                        attempt = delivery.attempt,
                        worker_id,
                        "Redelivering job message",
                    );
                }
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, job_id: JobId, worker_id: &str) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE job_id = $1 AND leased_by = $2")
            .bind(job_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(broker_error)?;
        if result.rows_affected() == 0 {
            tracing::debug!(
                job_id = %job_id,
                worker_id,
                "Ignoring ack from a worker that does not hold the lease",
            );
        }
        Ok(())
    }

    async fn renew(&self, job_id: JobId, worker_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE job_queue \
             SET lease_expires_at = NOW() + make_interval(secs => $3) \
             WHERE job_id = $1 AND leased_by = $2",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(self.lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, job_id: JobId) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE job_id = $1 AND leased_by IS NULL")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(broker_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn depth(&self) -> Result<usize, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(broker_error)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn lease_duration(&self) -> Duration {
        self.lease
    }
}
