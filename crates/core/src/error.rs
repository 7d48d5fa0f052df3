use crate::job::JobState;
use crate::types::JobId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: JobId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a missing job record.
    pub fn job_not_found(id: JobId) -> Self {
        CoreError::NotFound { entity: "Job", id }
    }
}
