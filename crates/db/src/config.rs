use std::time::Duration;

/// Storage settings shared by the API and worker binaries.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL URL. When unset, processes fall back to in-memory backends.
    pub database_url: Option<String>,
    /// How long terminal records stay readable (default: 3600 s).
    pub retention: Duration,
    /// Broker lease length (default: 60 s).
    pub lease: Duration,
    /// Interval between expiry sweeps (default: 60 s).
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            retention: Duration::from_secs(3600),
            lease: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default |
    /// |-------------------------|---------|
    /// | `DATABASE_URL`          | unset   |
    /// | `RESULT_RETENTION_SECS` | `3600`  |
    /// | `LEASE_SECS`            | `60`    |
    /// | `RETENTION_SWEEP_SECS`  | `60`    |
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let retention_secs: u64 = std::env::var("RESULT_RETENTION_SECS")
            .unwrap_or_else(|_| "3600".into())
            .parse()
            .expect("RESULT_RETENTION_SECS must be a valid u64");

        let lease_secs: u64 = std::env::var("LEASE_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .expect("LEASE_SECS must be a valid u64");

        let sweep_secs: u64 = std::env::var("RETENTION_SWEEP_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .expect("RETENTION_SWEEP_SECS must be a valid u64");

        Self {
            database_url,
            retention: Duration::from_secs(retention_secs),
            lease: Duration::from_secs(lease_secs.max(1)),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
        }
    }
}
