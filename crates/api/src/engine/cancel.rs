//! Cancellation coordinator.
//!
//! Pending jobs are revoked directly (their queued message is withdrawn on a
//! best-effort basis). Running jobs are flagged and revoked by their worker
//! at the handler's next cancellation check. Finished jobs are left alone.

use std::sync::Arc;

use conveyor_core::error::CoreError;
use conveyor_core::job::{Job, JobState, Transition};
use conveyor_core::types::JobId;
use conveyor_db::{Broker, JobStore};
use serde::Serialize;

/// Result of a cancellation request, with the record as it stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "job", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job had not started and is now `REVOKED`.
    Revoked(Job),
    /// The job is running; its worker has been asked to stop.
    CancelRequested(Job),
    /// The job had already reached a terminal state.
    AlreadyFinished(Job),
}

impl CancelOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CancelOutcome::Revoked(job)
            | CancelOutcome::CancelRequested(job)
            | CancelOutcome::AlreadyFinished(job) => job,
        }
    }
}

pub struct CancellationCoordinator {
    store: Arc<JobStore>,
    broker: Arc<dyn Broker>,
}

impl CancellationCoordinator {
    pub fn new(store: Arc<JobStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Cancel a job. Returns immediately; running jobs stop asynchronously.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, CoreError> {
        let mut job = self.store.get(id).await?;

        // A pending job can be claimed between the read and the revoke.
        // `RevokePending` is only legal from PENDING, so a claimed job fails
        // the revoke and is flagged like any running job on the next pass.
        for _ in 0..2 {
            match job.state {
                JobState::Pending => match self.revoke_pending(id).await {
                    Ok(revoked) => return Ok(CancelOutcome::Revoked(revoked)),
                    Err(CoreError::IllegalTransition { .. }) => {
                        job = self.store.get(id).await?;
                    }
                    Err(e) => return Err(e),
                },
                JobState::Started | JobState::Progress => {
                    let flagged = self.store.request_cancel(id).await?;
                    return Ok(if flagged.is_terminal() {
                        CancelOutcome::AlreadyFinished(flagged)
                    } else {
                        CancelOutcome::CancelRequested(flagged)
                    });
                }
                JobState::Success | JobState::Failure | JobState::Revoked => {
                    tracing::debug!(job_id = %id, state = %job.state, "Cancel of finished job ignored");
                    return Ok(CancelOutcome::AlreadyFinished(job));
                }
            }
        }

        Err(CoreError::Internal(format!(
            "Job {id} changed state repeatedly during cancellation"
        )))
    }

    async fn revoke_pending(&self, id: JobId) -> Result<Job, CoreError> {
        match self.broker.remove(id).await {
            Ok(true) => tracing::debug!(job_id = %id, "Withdrew queued message"),
            Ok(false) => tracing::debug!(job_id = %id, "Queued message already claimed or gone"),
            Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to withdraw queued message"),
        }

        let job = self.store.update(id, Transition::RevokePending).await?;
        tracing::info!(job_id = %id, "Pending job revoked");
        Ok(job)
    }
}
