//! WebSocket message type constants for job status streaming.
//!
//! Used by the API's `stream_status` WebSocket handler when framing job
//! snapshots for connected clients.

/// A snapshot of the job (sent on every observed change).
pub const MSG_TYPE_JOB_STATUS: &str = "job_status";

/// The job reached a terminal state; the server closes the stream next.
pub const MSG_TYPE_STREAM_END: &str = "stream_end";

/// The stream could not continue (unknown id, store failure).
pub const MSG_TYPE_STREAM_ERROR: &str = "stream_error";
