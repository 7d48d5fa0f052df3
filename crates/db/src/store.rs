//! Job record store.
//!
//! [`JobStore`] is the single source of truth for job state. It wraps a
//! [`RecordBackend`], stamps writes with the current time and retention
//! window, and publishes a [`JobEvent`] on the change feed after every write
//! that changed a record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::error::CoreError;
use conveyor_core::job::{Job, JobFilter, Transition};
use conveyor_core::registry::ProgressSink;
use conveyor_core::types::JobId;
use conveyor_events::{EventBus, FeedItem, JobEvent};
use futures::Stream;

use crate::backend::{MemoryRecords, RecordBackend, WriteOutcome};

/// Default retention of terminal records: one hour.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// The job record store.
pub struct JobStore {
    backend: Arc<dyn RecordBackend>,
    bus: Arc<EventBus>,
    retention: Duration,
}

impl JobStore {
    pub fn new(backend: Arc<dyn RecordBackend>, bus: Arc<EventBus>, retention: Duration) -> Self {
        Self {
            backend,
            bus,
            retention,
        }
    }

    /// A store over a fresh [`MemoryRecords`] backend.
    pub fn in_memory(bus: Arc<EventBus>, retention: Duration) -> Self {
        Self::new(Arc::new(MemoryRecords::new()), bus, retention)
    }

    /// How long terminal records stay readable.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// The change feed this store publishes to.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Persist a new job record. Fails with `Conflict` if the id exists.
    pub async fn create(&self, job: &Job) -> Result<JobId, CoreError> {
        self.backend.insert(job).await?;
        self.bus.publish(JobEvent::new(job.id, job.state));
        tracing::debug!(job_id = %job.id, job_type = %job.type_name, "Job record created");
        Ok(job.id)
    }

    /// Apply a transition and return the resulting record.
    ///
    /// Re-applying a transition the record already reflects returns the
    /// record unchanged and publishes nothing. Illegal edges are logged and
    /// rejected with `IllegalTransition`.
    pub async fn update(&self, id: JobId, transition: Transition) -> Result<Job, CoreError> {
        let result = self
            .backend
            .apply(id, &transition, chrono::Utc::now(), self.retention)
            .await;

        match result {
            Ok(WriteOutcome { job, changed }) => {
                if changed {
                    self.bus.publish(JobEvent::new(id, job.state));
                    tracing::debug!(job_id = %id, state = %job.state, "Job state updated");
                }
                Ok(job)
            }
            Err(e @ CoreError::IllegalTransition { .. }) => {
                tracing::warn!(job_id = %id, error = %e, "Rejected job transition");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a job. Unknown and expired ids are both `NotFound`.
    pub async fn get(&self, id: JobId) -> Result<Job, CoreError> {
        self.backend
            .get(id, chrono::Utc::now())
            .await?
            .ok_or(CoreError::job_not_found(id))
    }

    /// Jobs matching `filter`, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, CoreError> {
        self.backend.scan(filter, chrono::Utc::now()).await
    }

    /// Subscribe to the change feed.
    ///
    /// The stream is lazy and unbounded; delivery is at-least-once and
    /// ordered per job only.
    pub fn subscribe(&self) -> impl Stream<Item = FeedItem> + Send + 'static {
        self.bus.feed()
    }

    /// Flag a running job for cooperative cancellation.
    ///
    /// Returns the current record; pending and terminal records are returned
    /// as they are.
    pub async fn request_cancel(&self, id: JobId) -> Result<Job, CoreError> {
        let WriteOutcome { job, changed } =
            self.backend.flag_cancel(id, chrono::Utc::now()).await?;
        if changed {
            self.bus
                .publish(JobEvent::new(id, job.state).with_cancel_requested());
            tracing::info!(job_id = %id, "Cancellation requested for running job");
        }
        Ok(job)
    }

    /// Remove a record outright. Used to roll back a submission whose
    /// enqueue failed; nothing else deletes live records.
    pub async fn remove(&self, id: JobId) -> Result<bool, CoreError> {
        self.backend.delete(id).await
    }

    /// Delete records whose retention window has elapsed.
    pub async fn purge_expired(&self) -> Result<u64, CoreError> {
        self.backend.purge_expired(chrono::Utc::now()).await
    }

    /// Verify the backend is reachable.
    pub async fn health_check(&self) -> Result<(), CoreError> {
        self.backend.ping().await
    }
}

#[async_trait]
impl ProgressSink for JobStore {
    async fn report(&self, job_id: JobId, meta: serde_json::Value) -> Result<(), CoreError> {
        self.update(job_id, Transition::Progress(meta)).await.map(|_| ())
    }
}
