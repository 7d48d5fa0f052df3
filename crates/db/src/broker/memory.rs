//! In-process broker.
//!
//! Ready messages sit in a FIFO; leased messages move to a map keyed by job
//! id until they are acknowledged or their lease lapses. Lapsed leases are
//! reclaimed lazily at the front of the queue on the next dequeue. Waiting
//! consumers park on a [`Notify`].

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::error::CoreError;
use conveyor_core::types::JobId;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{lease_deadline, Broker, Delivery, QueueMessage, DEFAULT_LEASE};

struct Ready {
    message: QueueMessage,
    /// Deliveries so far.
    attempts: u32,
}

struct Lease {
    message: QueueMessage,
    worker_id: String,
    attempts: u32,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Ready>,
    leased: HashMap<JobId, Lease>,
}

impl State {
    fn contains(&self, job_id: JobId) -> bool {
        self.leased.contains_key(&job_id) || self.ready.iter().any(|r| r.message.job_id == job_id)
    }

    /// Move lapsed leases back to the front of the ready queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<JobId> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_by_key(|id| std::cmp::Reverse(self.leased[id].message.enqueued_at));

        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                tracing::warn!(
                    job_id = %id,
                    worker_id = %lease.worker_id,
                    attempts = lease.attempts,
                    "Lease expired, message will be redelivered",
                );
                self.ready.push_front(Ready {
                    message: lease.message,
                    attempts: lease.attempts,
                });
            }
        }
    }

    fn next_lease_expiry(&self) -> Option<Instant> {
        self.leased.values().map(|l| l.expires_at).min()
    }
}

/// Broker held entirely in memory. Messages do not survive a restart.
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    lease: Duration,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            lease,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.contains(message.job_id) {
            tracing::debug!(job_id = %message.job_id, "Message already queued");
            return Ok(());
        }
        state.ready.push_back(Ready {
            message,
            attempts: 0,
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, CoreError> {
        let deadline = Instant::now() + wait;

        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now);

                if let Some(Ready { message, attempts }) = state.ready.pop_front() {
                    let attempts = attempts + 1;
                    state.leased.insert(
                        message.job_id,
                        Lease {
                            message: message.clone(),
                            worker_id: worker_id.to_string(),
                            attempts,
                            expires_at: now + self.lease,
                        },
                    );
                    // Pass the wake-up on if more work is waiting.
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Ok(Some(Delivery {
                        message,
                        worker_id: worker_id.to_string(),
                        attempt: attempts,
                        lease_expires_at: lease_deadline(self.lease),
                    }));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_lease_expiry()
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, job_id: JobId, worker_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let holder = state.leased.get(&job_id).map(|l| l.worker_id.clone());
        if holder.as_deref() == Some(worker_id) {
            state.leased.remove(&job_id);
        } else {
            tracing::debug!(
                job_id = %job_id,
                worker_id,
                lease_holder = holder.as_deref().unwrap_or("none"),
                "Ignoring ack from a worker that does not hold the lease",
            );
        }
        Ok(())
    }

    async fn renew(&self, job_id: JobId, worker_id: &str) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        match state.leased.get_mut(&job_id) {
            Some(lease) if lease.worker_id == worker_id => {
                lease.expires_at = Instant::now() + self.lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, job_id: JobId) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        let before = state.ready.len();
        state.ready.retain(|r| r.message.job_id != job_id);
        Ok(state.ready.len() < before)
    }

    async fn depth(&self) -> Result<usize, CoreError> {
        let state = self.state.lock().await;
        Ok(state.ready.len() + state.leased.len())
    }

    fn lease_duration(&self) -> Duration {
        self.lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    const NO_WAIT: Duration = Duration::ZERO;

    fn message() -> QueueMessage {
        QueueMessage::new(uuid::Uuid::now_v7(), "sleep", json!({"duration": 1}))
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let broker = MemoryBroker::new();
        let first = message();
        let second = message();
        broker.enqueue(first.clone()).await.unwrap();
        broker.enqueue(second.clone()).await.unwrap();

        let a = broker.dequeue("w-1", NO_WAIT).await.unwrap().unwrap();
        let b = broker.dequeue("w-1", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(a.message, first);
        assert_eq!(b.message, second);
        assert_eq!(a.attempt, 1);
        assert!(broker.dequeue("w-1", NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_ignored() {
        let broker = MemoryBroker::new();
        let msg = message();
        broker.enqueue(msg.clone()).await.unwrap();
        broker.enqueue(msg).await.unwrap();
        assert_eq!(broker.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_enqueue() {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.dequeue("w-1", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let msg = message();
        broker.enqueue(msg.clone()).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message, msg);
    }

    #[tokio::test]
    async fn acked_message_is_gone() {
        let broker = MemoryBroker::new();
        let msg = message();
        broker.enqueue(msg.clone()).await.unwrap();
        broker.dequeue("w-1", NO_WAIT).await.unwrap().unwrap();
        broker.ack(msg.job_id, "w-1").await.unwrap();

        assert_eq!(broker.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_from_a_lapsed_holder_keeps_the_new_lease() {
        let broker = MemoryBroker::with_lease(Duration::from_millis(30));
        let msg = message();
        broker.enqueue(msg.clone()).await.unwrap();
        broker.dequeue("w-1", NO_WAIT).await.unwrap().unwrap();
        broker
            .dequeue("w-2", Duration::from_millis(500))
            .await
            .unwrap()
            .expect("message should come back after the lease lapses");

        broker.ack(msg.job_id, "w-1").await.unwrap();
        assert_eq!(broker.depth().await.unwrap(), 1);
        assert!(broker.renew(msg.job_id, "w-2").await.unwrap());

        broker.ack(msg.job_id, "w-2").await.unwrap();
        assert_eq!(broker.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_of_an_unclaimed_message_is_ignored() {
        let broker = MemoryBroker::new();
        let msg = message();
        broker.enqueue(msg.clone()).await.unwrap();

        broker.ack(msg.job_id, "w-1").await.unwrap();
        assert_eq!(broker.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lapsed_lease_is_redelivered_with_next_attempt() {
        let broker = MemoryBroker::with_lease(Duration::from_millis(30));
        let msg = message();
        broker.enqueue(msg.clone()).await.unwrap();
        broker.dequeue("w-1", NO_WAIT).await.unwrap().unwrap();

        assert!(broker.dequeue("w-2", NO_WAIT).await.unwrap().is_none());
        let redelivered = broker
            .dequeue("w-2", Duration::from_millis(500))
            .await
            .unwrap()
            .expect("message should come back after the lease lapses");

        assert_eq!(redelivered.message, msg);
        assert_eq!(redelivered.attempt, 2);
        assert!(redelivered.is_redelivery());
        assert!(!broker.renew(msg.job_id, "w-1").await.unwrap());
    }

    #[tokio::test]
    async fn renewal_keeps_the_lease() {
        let broker = MemoryBroker::with_lease(Duration::from_millis(60));
        let msg = message();
        broker.enqueue(msg.clone()).await.unwrap();
        broker.dequeue("w-1", NO_WAIT).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(broker.renew(msg.job_id, "w-1").await.unwrap());
        }
        assert!(broker.dequeue("w-2", NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_only_withdraws_unclaimed_messages() {
        let broker = MemoryBroker::new();
        let claimed = message();
        let waiting = message();
        broker.enqueue(claimed.clone()).await.unwrap();
        broker.enqueue(waiting.clone()).await.unwrap();
        broker.dequeue("w-1", NO_WAIT).await.unwrap().unwrap();

        assert!(!broker.remove(claimed.job_id).await.unwrap());
        assert!(broker.remove(waiting.job_id).await.unwrap());
        assert!(!broker.remove(waiting.job_id).await.unwrap());
        assert_eq!(broker.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn each_message_goes_to_one_consumer() {
        let broker = Arc::new(MemoryBroker::new());
        for _ in 0..20 {
            broker.enqueue(message()).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let broker = Arc::clone(&broker);
            handles.push(tokio::spawn(async move {
                let worker = format!("w-{w}");
                let mut got = Vec::new();
                while let Some(d) = broker.dequeue(&worker, NO_WAIT).await.unwrap() {
                    got.push(d.job_id());
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }
}
