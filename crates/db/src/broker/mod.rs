//! Queue/broker: durable hand-off of job messages from submitters to workers.
//!
//! Delivery is at-least-once. A dequeued message is leased to one worker for
//! [`Broker::lease_duration`]; if the worker neither acknowledges nor renews
//! the lease before it lapses, the message becomes claimable again with its
//! attempt counter bumped. Redelivery is therefore normal and consumers must
//! tolerate it.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::error::CoreError;
use conveyor_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};

pub use memory::MemoryBroker;
pub use postgres::PgBroker;

/// Default lease duration.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// What a submitter hands to the broker: the job id plus enough to dispatch
/// it without reading the record first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: JobId,
    pub type_name: String,
    pub input: serde_json::Value,
    pub enqueued_at: Timestamp,
}

impl QueueMessage {
    pub fn new(job_id: JobId, type_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            job_id,
            type_name: type_name.into(),
            input,
            enqueued_at: chrono::Utc::now(),
        }
    }
}

/// A message leased to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: QueueMessage,
    pub worker_id: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub lease_expires_at: Timestamp,
}

impl Delivery {
    pub fn job_id(&self) -> JobId {
        self.message.job_id
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// Queue operations shared by the submit path, the cancellation coordinator
/// and the worker pool.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make a message available for delivery. Enqueueing an id that is
    /// already queued is a no-op.
    async fn enqueue(&self, message: QueueMessage) -> Result<(), CoreError>;

    /// Lease the oldest claimable message to `worker_id`, waiting up to
    /// `wait` for one to appear.
    async fn dequeue(&self, worker_id: &str, wait: Duration)
        -> Result<Option<Delivery>, CoreError>;

    /// Remove a delivered message for good. A no-op unless `worker_id` still
    /// holds the lease.
    async fn ack(&self, job_id: JobId, worker_id: &str) -> Result<(), CoreError>;

    /// Extend `worker_id`'s lease. Returns `false` if the lease was lost.
    async fn renew(&self, job_id: JobId, worker_id: &str) -> Result<bool, CoreError>;

    /// Withdraw a message that no worker has claimed yet. Returns whether a
    /// message was withdrawn.
    async fn remove(&self, job_id: JobId) -> Result<bool, CoreError>;

    /// Messages enqueued and not yet acknowledged.
    async fn depth(&self) -> Result<usize, CoreError>;

    fn lease_duration(&self) -> Duration;
}

/// Wall-clock expiry of a lease taken now.
pub(crate) fn lease_deadline(lease: Duration) -> Timestamp {
    let lease = chrono::TimeDelta::from_std(lease).unwrap_or(chrono::TimeDelta::MAX);
    let now = chrono::Utc::now();
    now.checked_add_signed(lease).unwrap_or(now)
}
