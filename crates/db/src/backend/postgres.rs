//! PostgreSQL record backend (`jobs` table).
//!
//! Writes run in a transaction that locks the row with `SELECT … FOR UPDATE`,
//! folds the transition in with [`Job::apply`], writes the new row back and
//! emits `pg_notify('job_events', …)` so other processes observe the change.
//! Reads never take row locks.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::error::CoreError;
use conveyor_core::job::{Applied, Job, JobError, JobFilter, JobState, Transition};
use conveyor_core::types::{JobId, Timestamp};
use conveyor_events::{JobEvent, JOB_EVENTS_CHANNEL};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use super::{RecordBackend, WriteOutcome};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, type_name, state, input, progress, result, error, worker_id, \
    cancel_requested, created_at, started_at, finished_at, expires_at";

/// A row from the `jobs` table.
#[derive(Debug, FromRow)]
struct JobRow {
    id: JobId,
    type_name: String,
    state: String,
    input: serde_json::Value,
    progress: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    error: Option<Json<JobError>>,
    worker_id: Option<String>,
    cancel_requested: bool,
    created_at: Timestamp,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    expires_at: Option<Timestamp>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            type_name: row.type_name,
            input: row.input,
            state: row.state.parse()?,
            progress: row.progress,
            result: row.result,
            error: row.error.map(|e| e.0),
            worker_id: row.worker_id,
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            expires_at: row.expires_at,
        })
    }
}

/// Map a sqlx error onto the domain error.
fn store_error(err: sqlx::Error) -> CoreError {
    tracing::error!(error = %err, "Job store query failed");
    CoreError::StoreUnavailable(err.to_string())
}

/// Record backend over the `jobs` table.
#[derive(Clone)]
pub struct PgRecords {
    pool: PgPool,
}

impl PgRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock a live row for the rest of `tx`.
    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
        now: Timestamp,
    ) -> Result<Job, CoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE id = $1 AND (expires_at IS NULL OR expires_at > $2) \
             FOR UPDATE"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(now)
            .fetch_optional(&mut **tx)
            .await
            .map_err(store_error)?
            .ok_or(CoreError::job_not_found(id))?;
        Job::try_from(row)
    }

    /// Write every mutable column of `job` back to its row.
    async fn write_row(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE jobs \
             SET state = $2, progress = $3, result = $4, error = $5, worker_id = $6, \
                 cancel_requested = $7, started_at = $8, finished_at = $9, expires_at = $10 \
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(&job.progress)
        .bind(&job.result)
        .bind(job.error.as_ref().map(Json))
        .bind(&job.worker_id)
        .bind(job.cancel_requested)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.expires_at)
        .execute(&mut **tx)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn notify(tx: &mut Transaction<'_, Postgres>, event: &JobEvent) -> Result<(), CoreError> {
        let payload =
            serde_json::to_string(event).map_err(|e| CoreError::Internal(e.to_string()))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(JOB_EVENTS_CHANNEL)
            .bind(payload)
            .execute(&mut **tx)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

#[async_trait]
impl RecordBackend for PgRecords {
    async fn insert(&self, job: &Job) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let inserted = sqlx::query(
            "INSERT INTO jobs (id, type_name, state, input, cancel_requested, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(job.id)
        .bind(&job.type_name)
        .bind(job.state.as_str())
        .bind(&job.input)
        .bind(job.cancel_requested)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        if inserted.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!("Job id {} already exists", job.id)));
        }

        Self::notify(&mut tx, &JobEvent::new(job.id, job.state)).await?;
        tx.commit().await.map_err(store_error)
    }

    async fn get(&self, id: JobId, now: Timestamp) -> Result<Option<Job>, CoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE id = $1 AND (expires_at IS NULL OR expires_at > $2)"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .map(Job::try_from)
            .transpose()
    }

    async fn apply(
        &self,
        id: JobId,
        transition: &Transition,
        now: Timestamp,
        retention: Duration,
    ) -> Result<WriteOutcome, CoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let current = Self::lock_row(&mut tx, id, now).await?;

        match current.apply(transition, now, retention)? {
            Applied::Changed(next) => {
                Self::write_row(&mut tx, &next).await?;
                Self::notify(&mut tx, &JobEvent::new(id, next.state)).await?;
                tx.commit().await.map_err(store_error)?;
                Ok(WriteOutcome {
                    job: next,
                    changed: true,
                })
            }
            // Dropping `tx` rolls back and releases the row lock.
            Applied::Unchanged => Ok(WriteOutcome {
                job: current,
                changed: false,
            }),
        }
    }

    async fn flag_cancel(&self, id: JobId, now: Timestamp) -> Result<WriteOutcome, CoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let mut job = Self::lock_row(&mut tx, id, now).await?;

        if !job.state.is_running() || job.cancel_requested {
            return Ok(WriteOutcome {
                job,
                changed: false,
            });
        }

        job.cancel_requested = true;
        Self::write_row(&mut tx, &job).await?;
        Self::notify(&mut tx, &JobEvent::new(id, job.state).with_cancel_requested()).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(WriteOutcome { job, changed: true })
    }

    async fn scan(&self, filter: &JobFilter, now: Timestamp) -> Result<Vec<Job>, CoreError> {
        let states: Vec<&str> = filter.states.iter().map(|s| JobState::as_str(*s)).collect();
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE (cardinality($1::text[]) = 0 OR state = ANY($1)) \
               AND (expires_at IS NULL OR expires_at > $2) \
             ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(&states)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn delete(&self, id: JobId) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), CoreError> {
        crate::health_check(&self.pool).await.map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(state: &str) -> JobRow {
        JobRow {
            id: uuid::Uuid::now_v7(),
            type_name: "calculation".into(),
            state: state.into(),
            input: json!({"numbers": [1], "operation": "sum"}),
            progress: None,
            result: None,
            error: Some(Json(JobError::new("boom").with_kind("ValueError"))),
            worker_id: Some("w-1".into()),
            cancel_requested: false,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn row_converts_to_job() {
        let job = Job::try_from(row("FAILURE")).unwrap();
        assert_eq!(job.state, JobState::Failure);
        assert_eq!(job.error.unwrap().kind.as_deref(), Some("ValueError"));
        assert_eq!(job.worker_id.as_deref(), Some("w-1"));
    }

    #[test]
    fn unknown_state_in_row_is_internal_error() {
        assert!(matches!(
            Job::try_from(row("DONE")),
            Err(CoreError::Internal(_))
        ));
    }
}
