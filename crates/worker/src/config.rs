use std::time::Duration;

/// Worker pool configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for the worker ids recorded on claimed jobs; each slot appends
    /// its index.
    pub name: String,
    /// Number of execution slots (default: `4`).
    pub concurrency: usize,
    /// How often a running job re-reads its record for a cancellation flag
    /// the change feed may have missed (default: 500 ms).
    pub cancel_poll: Duration,
    /// Longest a single `dequeue` call waits before the slot loops.
    pub dequeue_wait: Duration,
    /// Settings for the built-in job types.
    pub tasks: TaskConfig,
}

/// Settings for the built-in job types.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Ticks the sleep task may run before failing (default: `180`).
    pub max_timeout_ticks: u64,
    /// Length of one sleep-task tick (one second outside tests).
    pub tick: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_timeout_ticks: 180,
            tick: Duration::from_secs(1),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: format!("worker-{}", std::process::id()),
            concurrency: 4,
            cancel_poll: Duration::from_millis(500),
            dequeue_wait: Duration::from_secs(1),
            tasks: TaskConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default         |
    /// |---------------------------|-----------------|
    /// | `WORKER_NAME`             | `worker-<pid>`  |
    /// | `WORKER_CONCURRENCY`      | `4`             |
    /// | `WORKER_MAX_TIMEOUT_SECS` | `180`           |
    /// | `CANCEL_POLL_MS`          | `500`           |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name = std::env::var("WORKER_NAME").unwrap_or(defaults.name);

        let concurrency: usize = std::env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "4".into())
            .parse()
            .expect("WORKER_CONCURRENCY must be a valid usize");
        assert!(concurrency > 0, "WORKER_CONCURRENCY must be at least 1");

        let max_timeout_ticks: u64 = std::env::var("WORKER_MAX_TIMEOUT_SECS")
            .unwrap_or_else(|_| "180".into())
            .parse()
            .expect("WORKER_MAX_TIMEOUT_SECS must be a valid u64");

        let cancel_poll_ms: u64 = std::env::var("CANCEL_POLL_MS")
            .unwrap_or_else(|_| "500".into())
            .parse()
            .expect("CANCEL_POLL_MS must be a valid u64");

        Self {
            name,
            concurrency,
            cancel_poll: Duration::from_millis(cancel_poll_ms),
            dequeue_wait: defaults.dequeue_wait,
            tasks: TaskConfig {
                max_timeout_ticks,
                ..TaskConfig::default()
            },
        }
    }
}
