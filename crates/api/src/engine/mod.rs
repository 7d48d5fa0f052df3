//! Services behind the HTTP surface.
//!
//! - [`JobSubmitter`]: validate, record and enqueue new jobs.
//! - [`StatusService`]: point reads, the active list and live streams.
//! - [`CancellationCoordinator`]: revoke or flag jobs for cancellation.

pub mod cancel;
pub mod status;
pub mod submit;

pub use cancel::{CancelOutcome, CancellationCoordinator};
pub use status::StatusService;
pub use submit::JobSubmitter;
