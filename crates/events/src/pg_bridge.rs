//! Cross-process change feed over PostgreSQL `LISTEN`/`NOTIFY`.
//!
//! The PostgreSQL record backend issues `pg_notify('job_events', <json>)` in
//! the same transaction as every write. [`PgEventBridge`] listens on that
//! channel and republishes each payload on the local [`EventBus`], so an API
//! process sees transitions written by worker processes (and vice versa).

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, JobEvent};

/// Notification channel written by the PostgreSQL record backend.
pub const JOB_EVENTS_CHANNEL: &str = "job_events";

/// Delay before reconnecting after the listener connection fails.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Background service forwarding `NOTIFY job_events` into an [`EventBus`].
pub struct PgEventBridge;

impl PgEventBridge {
    /// Run the bridge until `cancel` is triggered, reconnecting on failure.
    pub async fn run(pool: PgPool, bus: Arc<EventBus>, cancel: CancellationToken) {
        tracing::info!(channel = JOB_EVENTS_CHANNEL, "Job event bridge started");

        loop {
            let mut listener = match Self::connect(&pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::warn!(error = %e, "Job event bridge failed to listen, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Job event bridge shutting down");
                        return;
                    }
                    received = listener.recv() => match received {
                        Ok(notification) => Self::forward(&bus, notification.payload()),
                        Err(e) => {
                            tracing::warn!(error = %e, "Job event bridge lost its connection");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn connect(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(JOB_EVENTS_CHANNEL).await?;
        Ok(listener)
    }

    /// Decode one notification payload and publish it locally.
    fn forward(bus: &EventBus, payload: &str) {
        match serde_json::from_str::<JobEvent>(payload) {
            Ok(event) => bus.publish(event),
            Err(e) => {
                tracing::warn!(error = %e, payload, "Discarding malformed job event notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::job::JobState;

    #[tokio::test]
    async fn forward_publishes_decoded_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = JobEvent::new(uuid::Uuid::now_v7(), JobState::Failure);
        PgEventBridge::forward(&bus, &serde_json::to_string(&event).unwrap());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn forward_ignores_malformed_payload() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        PgEventBridge::forward(&bus, "not json");

        assert!(rx.try_recv().is_err());
    }
}
