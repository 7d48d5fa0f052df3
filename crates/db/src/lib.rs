//! Persistence for the conveyor job system.
//!
//! - [`JobStore`]: the job record store: create/update/get/list plus the
//!   change feed. Delegates storage to a [`RecordBackend`].
//! - [`backend`]: the record backend trait and its in-memory and
//!   PostgreSQL implementations.
//! - [`broker`]: the queue/broker trait and its implementations.
//! - [`sweeper`]: background deletion of expired records.

pub mod backend;
pub mod broker;
pub mod config;
pub mod store;
pub mod sweeper;

use sqlx::postgres::PgPoolOptions;

pub use backend::{MemoryRecords, PgRecords, RecordBackend, WriteOutcome};
pub use broker::{Broker, Delivery, MemoryBroker, PgBroker, QueueMessage};
pub use config::StoreConfig;
pub use store::JobStore;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run a trivial query to verify the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations (`crates/db/migrations`).
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
