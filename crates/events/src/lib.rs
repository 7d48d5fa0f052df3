//! Job change feed.
//!
//! - [`EventBus`]: in-process publish/subscribe hub for [`JobEvent`]s, backed
//!   by `tokio::sync::broadcast`.
//! - [`PgEventBridge`]: background service that forwards PostgreSQL
//!   `NOTIFY job_events` payloads into the local bus, so writes made by other
//!   processes reach this process's subscribers.

pub mod bus;
pub mod pg_bridge;

pub use bus::{EventBus, FeedItem, JobEvent};
pub use pg_bridge::{PgEventBridge, JOB_EVENTS_CHANNEL};
