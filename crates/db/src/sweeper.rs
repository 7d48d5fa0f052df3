//! Periodic deletion of expired job records.
//!
//! Reads already hide expired records; the sweeper reclaims their storage.
//! Runs on a fixed `tokio::time::interval` until cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::store::JobStore;

/// Run the expiry sweep loop until `cancel` is triggered.
pub async fn run(store: Arc<JobStore>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(
        retention_secs = store.retention().as_secs(),
        interval_secs = interval.as_secs(),
        "Job retention sweeper started",
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention sweeper stopping");
                break;
            }
            _ = ticker.tick() => match store.purge_expired().await {
                Ok(0) => tracing::debug!("Job retention: nothing to purge"),
                Ok(deleted) => tracing::info!(deleted, "Job retention: purged expired records"),
                Err(e) => tracing::error!(error = %e, "Job retention: sweep failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::job::{Job, Transition};
    use conveyor_events::EventBus;
    use serde_json::json;

    #[tokio::test]
    async fn sweeps_expired_records_until_cancelled() {
        let store = Arc::new(JobStore::in_memory(Arc::new(EventBus::default()), Duration::ZERO));
        let done = Job::new("sleep", json!({}));
        let live = Job::new("sleep", json!({}));
        store.create(&done).await.unwrap();
        store.create(&live).await.unwrap();
        store.update(done.id, Transition::Revoke).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&store),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert!(store.get(live.id).await.is_ok());
    }
}
