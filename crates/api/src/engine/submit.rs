//! Job submission: validate, record, enqueue.

use std::sync::Arc;

use conveyor_core::error::CoreError;
use conveyor_core::job::Job;
use conveyor_core::registry::DispatchRegistry;
use conveyor_db::{Broker, JobStore, QueueMessage};

pub struct JobSubmitter {
    registry: Arc<DispatchRegistry>,
    store: Arc<JobStore>,
    broker: Arc<dyn Broker>,
}

impl JobSubmitter {
    pub fn new(
        registry: Arc<DispatchRegistry>,
        store: Arc<JobStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            registry,
            store,
            broker,
        }
    }

    /// Validate `raw_input` for `type_name`, create the `PENDING` record and
    /// enqueue it.
    ///
    /// Invalid input creates nothing. If the enqueue fails the record is
    /// removed again and the broker error is returned.
    pub async fn submit(
        &self,
        type_name: &str,
        raw_input: serde_json::Value,
    ) -> Result<Job, CoreError> {
        let input = self.registry.validate_and_wrap(type_name, &raw_input)?;

        let job = Job::new(type_name, input.clone());
        self.store.create(&job).await?;

        let message = QueueMessage::new(job.id, type_name, input);
        if let Err(e) = self.broker.enqueue(message).await {
            tracing::error!(job_id = %job.id, error = %e, "Enqueue failed, rolling back job record");
            if let Err(rollback) = self.store.remove(job.id).await {
                tracing::error!(job_id = %job.id, error = %rollback, "Failed to roll back job record");
            }
            return Err(match e {
                CoreError::BrokerUnavailable(_) => e,
                other => CoreError::BrokerUnavailable(other.to_string()),
            });
        }

        tracing::info!(job_id = %job.id, job_type = %type_name, "Job submitted");
        Ok(job)
    }
}
