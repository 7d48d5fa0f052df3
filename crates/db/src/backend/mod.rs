//! Record backends: the key-value primitives the job record store needs.
//!
//! A backend stores [`Job`] records keyed by id and applies transitions
//! atomically per key. The transition rules themselves live in
//! [`Job::apply`]; a backend only provides the per-key lock around the
//! read-modify-write and the expiry-aware reads.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::error::CoreError;
use conveyor_core::job::{Job, JobFilter, Transition};
use conveyor_core::types::{JobId, Timestamp};

pub use memory::MemoryRecords;
pub use postgres::PgRecords;

/// The record after a write, and whether the write changed it.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub job: Job,
    pub changed: bool,
}

/// Storage primitives for job records.
///
/// Every read treats a record whose `expires_at` has passed as absent, even
/// before the sweeper physically deletes it.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id exists.
    async fn insert(&self, job: &Job) -> Result<(), CoreError>;

    /// Fetch a live record.
    async fn get(&self, id: JobId, now: Timestamp) -> Result<Option<Job>, CoreError>;

    /// Apply `transition` under the record's lock.
    ///
    /// `NotFound` for missing or expired records, `IllegalTransition` (record
    /// untouched) for edges outside the state machine.
    async fn apply(
        &self,
        id: JobId,
        transition: &Transition,
        now: Timestamp,
        retention: Duration,
    ) -> Result<WriteOutcome, CoreError>;

    /// Set `cancel_requested` if the job is running and not yet flagged.
    ///
    /// Records in any other state are returned unchanged.
    async fn flag_cancel(&self, id: JobId, now: Timestamp) -> Result<WriteOutcome, CoreError>;

    /// Live records matching `filter`, newest `created_at` first.
    async fn scan(&self, filter: &JobFilter, now: Timestamp) -> Result<Vec<Job>, CoreError>;

    /// Remove a record outright. Returns whether it existed.
    async fn delete(&self, id: JobId) -> Result<bool, CoreError>;

    /// Delete every record whose retention window ended at or before `now`.
    async fn purge_expired(&self, now: Timestamp) -> Result<u64, CoreError>;

    /// Verify the backend is reachable.
    async fn ping(&self) -> Result<(), CoreError>;
}
