//! In-process change feed backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`JobEvent`]s. It is
//! designed to be shared via `Arc<EventBus>` between the job record store
//! (publisher) and the status service and worker cancel watchers
//! (subscribers).

use chrono::{DateTime, Utc};
use conveyor_core::job::JobState;
use conveyor_core::types::JobId;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A job record was written.
///
/// Events carry only the id and the state reached; consumers re-read the
/// record for details. Delivery is at-least-once and ordered per job only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub state: JobState,
    /// Set when the write was a cancellation request on a running job.
    #[serde(default)]
    pub cancel_requested: bool,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            cancel_requested: false,
            timestamp: Utc::now(),
        }
    }

    /// Mark the event as a cancellation request.
    pub fn with_cancel_requested(mut self) -> Self {
        self.cancel_requested = true;
        self
    }
}

/// One item of a subscriber's feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(JobEvent),
    /// The subscriber fell behind and `n` events were dropped; consumers
    /// should re-read any record they care about.
    Lagged(u64),
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out change feed.
///
/// # Usage
///
/// ```rust
/// use conveyor_core::job::JobState;
/// use conveyor_events::bus::{EventBus, JobEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(JobEvent::new(uuid::Uuid::now_v7(), JobState::Pending));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: JobEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a lazy, unbounded stream.
    ///
    /// The subscription is registered when this is called, not when the
    /// stream is first polled, so events published in between are kept.
    pub fn feed(&self) -> impl Stream<Item = FeedItem> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).map(|item| match item {
            Ok(event) => FeedItem::Event(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => FeedItem::Lagged(n),
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
