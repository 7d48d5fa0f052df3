//! Status service: point reads, the active list, and live snapshot streams.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::error::CoreError;
use conveyor_core::job::{Job, JobFilter};
use conveyor_core::types::JobId;
use conveyor_db::JobStore;
use conveyor_events::FeedItem;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio::time::{Interval, MissedTickBehavior};

pub struct StatusService {
    store: Arc<JobStore>,
    poll_interval: Duration,
}

impl StatusService {
    pub fn new(store: Arc<JobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    pub async fn get_status(&self, id: JobId) -> Result<Job, CoreError> {
        self.store.get(id).await
    }

    /// Pending, started and in-progress jobs, newest first.
    pub async fn list_active(&self) -> Result<Vec<Job>, CoreError> {
        self.store.list(&JobFilter::active()).await
    }

    /// Snapshots of one job, ending after the first terminal snapshot.
    ///
    /// The first item is always the current record (or the error reading
    /// it, which also ends the stream). After that a new snapshot is read
    /// whenever the change feed mentions the job, the feed reports lag, or
    /// the poll interval elapses; consecutive identical snapshots are
    /// suppressed. Each call is an independent stream.
    pub fn stream_status(
        &self,
        id: JobId,
    ) -> impl Stream<Item = Result<Job, CoreError>> + Send + 'static {
        // Subscribe before the first read so no write in between is missed.
        let feed = self.store.subscribe().boxed();

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cursor = SnapshotCursor {
            store: Arc::clone(&self.store),
            id,
            feed,
            feed_open: true,
            ticker,
            last: None,
            finished: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next_snapshot().await?;
            Some((item, cursor))
        })
    }
}

struct SnapshotCursor {
    store: Arc<JobStore>,
    id: JobId,
    feed: BoxStream<'static, FeedItem>,
    feed_open: bool,
    ticker: Interval,
    last: Option<Job>,
    finished: bool,
}

impl SnapshotCursor {
    async fn next_snapshot(&mut self) -> Option<Result<Job, CoreError>> {
        if self.finished {
            return None;
        }

        loop {
            if self.last.is_some() {
                self.wait_for_change().await;
            }

            match self.store.get(self.id).await {
                Ok(job) => {
                    if self.last.as_ref() == Some(&job) {
                        continue;
                    }
                    self.finished = job.is_terminal();
                    self.last = Some(job.clone());
                    return Some(Ok(job));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }

    /// Resolve when the record may have changed.
    async fn wait_for_change(&mut self) {
        loop {
            tokio::select! {
                item = self.feed.next(), if self.feed_open => match item {
                    Some(FeedItem::Event(event)) if event.job_id != self.id => continue,
                    Some(_) => return,
                    None => {
                        tracing::debug!(job_id = %self.id, "Change feed closed, polling only");
                        self.feed_open = false;
                    }
                },
                _ = self.ticker.tick() => return,
            }
        }
    }
}
