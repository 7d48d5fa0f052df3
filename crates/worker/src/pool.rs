//! Worker execution engine.
//!
//! A [`WorkerPool`] runs a fixed number of slots. Each slot blocks on
//! [`Broker::dequeue`], claims the job by writing `STARTED`, runs the handler
//! in its own task, and writes exactly one terminal state before
//! acknowledging the message. While a handler runs, a supervisor task renews
//! the broker lease and trips the job's cancellation token when the record
//! is flagged for cancellation.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::error::CoreError;
use conveyor_core::job::{JobError, Transition};
use conveyor_core::registry::{DispatchRegistry, HandlerError, JobContext, ProgressSink};
use conveyor_core::types::JobId;
use conveyor_db::{Broker, Delivery, JobStore};
use conveyor_events::FeedItem;
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::WorkerConfig;

/// Pause after a broker error before a slot dequeues again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Lower bound for the supervisor's timers.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(10);

/// How a delivered message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Revoked,
    /// The record was missing, already terminal, or claimed elsewhere; the
    /// handler did not run.
    Skipped,
    /// A store or broker error interrupted processing. The message was not
    /// acknowledged and will be redelivered once its lease lapses.
    Abandoned,
}

enum Claim {
    Run,
    Skip,
    /// Redelivered while a cancellation request was pending.
    RevokeNow,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    store: Arc<JobStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<DispatchRegistry>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<JobStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<DispatchRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            config,
        }
    }

    /// Run every slot until `shutdown` is triggered.
    ///
    /// Slots stop taking new messages as soon as shutdown is requested but
    /// finish the job they are running.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            worker = %self.config.name,
            concurrency = self.config.concurrency,
            job_types = ?self.registry.type_names(),
            "Worker pool started",
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.config.concurrency {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            slots.spawn(async move { pool.slot_loop(slot, shutdown).await });
        }

        while let Some(result) = slots.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker slot terminated abnormally");
            }
        }
        tracing::info!(worker = %self.config.name, "Worker pool stopped");
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        let worker_id = format!("{}-{slot}", self.config.name);

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.broker.dequeue(&worker_id, self.config.dequeue_wait) => result,
            };

            match delivery {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::debug!(worker_id = %worker_id, "Worker slot stopped");
    }

    /// Handle one delivered message from claim to acknowledgement.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let span = tracing::info_span!(
            "job",
            job_id = %delivery.job_id(),
            job_type = %delivery.message.type_name,
            worker_id = %delivery.worker_id,
            attempt = delivery.attempt,
        );
        self.process_delivery(delivery).instrument(span).await
    }

    async fn process_delivery(&self, delivery: Delivery) -> Outcome {
        let job_id = delivery.job_id();

        let result = match self.claim(&delivery).await {
            Ok(Claim::Run) => self.execute(&delivery).await,
            Ok(Claim::Skip) => Ok(Outcome::Skipped),
            Ok(Claim::RevokeNow) => self.finish(job_id, Transition::Revoke).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                if let Err(e) = self.broker.ack(job_id, &delivery.worker_id).await {
                    tracing::warn!(error = %e, "Failed to acknowledge message");
                }
                outcome
            }
            Err(e) => {
                tracing::error!(error = %e, "Job processing interrupted, leaving message for redelivery");
                Outcome::Abandoned
            }
        }
    }

    /// Decide whether to run the handler, writing `STARTED` for fresh jobs.
    async fn claim(&self, delivery: &Delivery) -> Result<Claim, CoreError> {
        let job_id = delivery.job_id();
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(CoreError::NotFound { .. }) => {
                tracing::warn!("Job record missing, dropping message");
                return Ok(Claim::Skip);
            }
            Err(e) => return Err(e),
        };

        if job.is_terminal() {
            tracing::info!(state = %job.state, "Job already finished, dropping message");
            return Ok(Claim::Skip);
        }

        if job.state.is_running() && job.cancel_requested {
            return Ok(Claim::RevokeNow);
        }

        let worker_id = delivery.worker_id.clone();
        let (transition, action) = if job.state.is_running() {
            tracing::warn!(
                previous_worker = job.worker_id.as_deref().unwrap_or("unknown"),
                "Re-executing job after redelivery",
            );
            (Transition::Reassign { worker_id }, "Job reassigned")
        } else {
            (Transition::Start { worker_id }, "Job started")
        };

        match self.store.update(job_id, transition).await {
            Ok(_) => {
                tracing::info!("{action}");
                Ok(Claim::Run)
            }
            Err(CoreError::IllegalTransition { from, .. }) => {
                tracing::info!(state = %from, "Job changed before it could start, dropping message");
                Ok(Claim::Skip)
            }
            Err(CoreError::NotFound { .. }) => Ok(Claim::Skip),
            Err(e) => Err(e),
        }
    }

    /// Run the handler under a supervisor and record how it ended.
    async fn execute(&self, delivery: &Delivery) -> Result<Outcome, CoreError> {
        let job_id = delivery.job_id();
        let type_name = &delivery.message.type_name;

        let Some(handler) = self.registry.handler(type_name) else {
            tracing::error!("No handler registered for job type");
            let error = JobError::new(format!("No handler registered for job type '{type_name}'"))
                .with_kind("UnknownJobType");
            return self.finish(job_id, Transition::Fail(error)).await;
        };

        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();
        let supervisor = Supervisor {
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            job_id,
            worker_id: delivery.worker_id.clone(),
            cancel_poll: self.config.cancel_poll,
        };
        let supervisor = tokio::spawn(
            supervisor
                .run(cancel.clone(), stop.clone())
                .in_current_span(),
        );

        let ctx = JobContext::new(
            job_id,
            Arc::clone(&self.store) as Arc<dyn ProgressSink>,
            cancel,
        );
        let input = delivery.message.input.clone();
        let result =
            tokio::spawn(async move { handler.run(input, ctx).await }.in_current_span()).await;

        stop.cancel();
        if let Err(e) = supervisor.await {
            tracing::warn!(error = %e, "Job supervisor terminated abnormally");
        }

        let transition = match result {
            Ok(Ok(value)) => {
                tracing::info!("Job succeeded");
                Transition::Succeed(value)
            }
            Ok(Err(HandlerError::Cancelled)) => {
                tracing::info!("Job revoked");
                Transition::Revoke
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Job failed");
                Transition::Fail(err.into())
            }
            Err(e) => {
                tracing::error!(error = %e, "Job handler panicked");
                Transition::Fail(JobError::new(e.to_string()).with_kind("Panic"))
            }
        };

        self.finish(job_id, transition).await
    }

    /// Write the terminal state.
    async fn finish(&self, job_id: JobId, transition: Transition) -> Result<Outcome, CoreError> {
        let outcome = match &transition {
            Transition::Succeed(_) => Outcome::Succeeded,
            Transition::Fail(_) => Outcome::Failed,
            Transition::Revoke | Transition::RevokePending => Outcome::Revoked,
            Transition::Start { .. } | Transition::Reassign { .. } | Transition::Progress(_) => {
                Outcome::Skipped
            }
        };

        match self.store.update(job_id, transition).await {
            Ok(_) => Ok(outcome),
            // Another delivery of the same message finished first.
            Err(CoreError::IllegalTransition { .. }) | Err(CoreError::NotFound { .. }) => {
                Ok(Outcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Watches one running job: renews its lease and trips its cancellation
/// token when the record is flagged.
struct Supervisor {
    store: Arc<JobStore>,
    broker: Arc<dyn Broker>,
    job_id: JobId,
    worker_id: String,
    cancel_poll: Duration,
}

impl Supervisor {
    async fn run(self, cancel: CancellationToken, stop: CancellationToken) {
        let mut feed = Box::pin(self.store.subscribe());
        let mut feed_open = true;

        let poll_period = self.cancel_poll.max(MIN_TIMER_PERIOD);
        let mut poll = tokio::time::interval(poll_period);

        let renew_period = (self.broker.lease_duration() / 3).max(MIN_TIMER_PERIOD);
        let mut renew =
            tokio::time::interval_at(tokio::time::Instant::now() + renew_period, renew_period);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                item = feed.next(), if feed_open => match item {
                    Some(FeedItem::Event(event)) => {
                        if event.job_id == self.job_id && event.cancel_requested {
                            self.trip(&cancel);
                        }
                    }
                    // Missed events are covered by the poll below.
                    Some(FeedItem::Lagged(_)) => {}
                    None => feed_open = false,
                },
                _ = poll.tick(), if !cancel.is_cancelled() => {
                    match self.store.get(self.job_id).await {
                        Ok(job) if job.cancel_requested => self.trip(&cancel),
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "Cancel poll failed"),
                    }
                }
                _ = renew.tick() => {
                    match self.broker.renew(self.job_id, &self.worker_id).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!("Lease lost, job may be redelivered"),
                        Err(e) => tracing::warn!(error = %e, "Lease renewal failed"),
                    }
                }
            }
        }
    }

    fn trip(&self, cancel: &CancellationToken) {
        if !cancel.is_cancelled() {
            tracing::info!("Cancellation observed, signalling handler");
            cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
