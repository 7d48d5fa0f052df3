//! Worker execution engine and built-in job types.
//!
//! - [`WorkerPool`]: fixed pool of slots consuming the broker.
//! - [`tasks`]: the `sleep` and `calculation` job types.
//! - [`WorkerConfig`]: pool settings from the environment.

pub mod config;
pub mod pool;
pub mod tasks;

pub use config::{TaskConfig, WorkerConfig};
pub use pool::{Outcome, WorkerPool};
