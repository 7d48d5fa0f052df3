/// Job identifiers are UUIDv7, so they sort by submission time.
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Allocate a fresh job id.
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7()
}
