//! In-process record backend.
//!
//! Records live in a map of per-key mutexes: writers take the map's read
//! lock only long enough to clone the entry handle, then lock the entry, so
//! writes to different ids never contend and scans never hold a lock a
//! writer needs for longer than one record copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::error::CoreError;
use conveyor_core::job::{Applied, Job, JobFilter, Transition};
use conveyor_core::types::{JobId, Timestamp};
use tokio::sync::{Mutex, RwLock};

use super::{RecordBackend, WriteOutcome};

type Entry = Arc<Mutex<Job>>;

/// Record backend held entirely in memory. Suitable for a single process.
#[derive(Default)]
pub struct MemoryRecords {
    jobs: RwLock<HashMap<JobId, Entry>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: JobId) -> Option<Entry> {
        self.jobs.read().await.get(&id).cloned()
    }

    async fn entries(&self) -> Vec<Entry> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl RecordBackend for MemoryRecords {
    async fn insert(&self, job: &Job) -> Result<(), CoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(CoreError::Conflict(format!("Job id {} already exists", job.id)));
        }
        jobs.insert(job.id, Arc::new(Mutex::new(job.clone())));
        Ok(())
    }

    async fn get(&self, id: JobId, now: Timestamp) -> Result<Option<Job>, CoreError> {
        let Some(entry) = self.entry(id).await else {
            return Ok(None);
        };
        let job = entry.lock().await;
        Ok((!job.is_expired(now)).then(|| job.clone()))
    }

    async fn apply(
        &self,
        id: JobId,
        transition: &Transition,
        now: Timestamp,
        retention: Duration,
    ) -> Result<WriteOutcome, CoreError> {
        let entry = self
            .entry(id)
            .await
            .ok_or(CoreError::job_not_found(id))?;
        let mut job = entry.lock().await;
        if job.is_expired(now) {
            return Err(CoreError::job_not_found(id));
        }

        match job.apply(transition, now, retention)? {
            Applied::Changed(next) => {
                *job = next;
                Ok(WriteOutcome {
                    job: job.clone(),
                    changed: true,
                })
            }
            Applied::Unchanged => Ok(WriteOutcome {
                job: job.clone(),
                changed: false,
            }),
        }
    }

    async fn flag_cancel(&self, id: JobId, now: Timestamp) -> Result<WriteOutcome, CoreError> {
        let entry = self
            .entry(id)
            .await
            .ok_or(CoreError::job_not_found(id))?;
        let mut job = entry.lock().await;
        if job.is_expired(now) {
            return Err(CoreError::job_not_found(id));
        }

        let changed = job.state.is_running() && !job.cancel_requested;
        if changed {
            job.cancel_requested = true;
        }
        Ok(WriteOutcome {
            job: job.clone(),
            changed,
        })
    }

    async fn scan(&self, filter: &JobFilter, now: Timestamp) -> Result<Vec<Job>, CoreError> {
        let mut matched = Vec::new();
        for entry in self.entries().await {
            let job = entry.lock().await;
            if filter.matches(&job) && !job.is_expired(now) {
                matched.push(job.clone());
            }
        }
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matched)
    }

    async fn delete(&self, id: JobId) -> Result<bool, CoreError> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, CoreError> {
        let mut expired = Vec::new();
        for entry in self.entries().await {
            let job = entry.lock().await;
            if job.is_expired(now) {
                expired.push(job.id);
            }
        }

        // Expired records are terminal and never change again, so the ids
        // collected above are still expired here.
        let mut jobs = self.jobs.write().await;
        let removed = expired
            .iter()
            .filter(|id| jobs.remove(*id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use conveyor_core::job::JobState;
    use serde_json::json;

    const RETENTION: Duration = Duration::from_secs(60);

    fn now() -> Timestamp {
        chrono::Utc::now()
    }

    fn start() -> Transition {
        Transition::Start {
            worker_id: "w-1".into(),
        }
    }

    #[tokio::test]
    async fn insert_then_get() {
        let backend = MemoryRecords::new();
        let job = Job::new("sleep", json!({"duration": 1}));
        backend.insert(&job).await.unwrap();

        assert_eq!(backend.get(job.id, now()).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let backend = MemoryRecords::new();
        let job = Job::new("sleep", json!({}));
        backend.insert(&job).await.unwrap();

        assert_matches!(backend.insert(&job).await, Err(CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn apply_to_missing_is_not_found() {
        let backend = MemoryRecords::new();
        let result = backend
            .apply(uuid::Uuid::now_v7(), &start(), now(), RETENTION)
            .await;
        assert_matches!(result, Err(CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn illegal_apply_leaves_record_untouched() {
        let backend = MemoryRecords::new();
        let job = Job::new("sleep", json!({}));
        backend.insert(&job).await.unwrap();

        let result = backend
            .apply(job.id, &Transition::Succeed(json!(1)), now(), RETENTION)
            .await;
        assert_matches!(result, Err(CoreError::IllegalTransition { .. }));
        assert_eq!(backend.get(job.id, now()).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn flag_cancel_only_marks_running_jobs() {
        let backend = MemoryRecords::new();
        let job = Job::new("sleep", json!({}));
        backend.insert(&job).await.unwrap();

        let pending = backend.flag_cancel(job.id, now()).await.unwrap();
        assert!(!pending.changed);
        assert!(!pending.job.cancel_requested);

        backend.apply(job.id, &start(), now(), RETENTION).await.unwrap();
        let first = backend.flag_cancel(job.id, now()).await.unwrap();
        assert!(first.changed);
        assert!(first.job.cancel_requested);

        let second = backend.flag_cancel(job.id, now()).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn expired_records_are_invisible_and_purged() {
        let backend = MemoryRecords::new();
        let job = Job::new("sleep", json!({}));
        backend.insert(&job).await.unwrap();
        backend
            .apply(job.id, &Transition::Revoke, now(), Duration::ZERO)
            .await
            .unwrap();

        let later = now() + chrono::TimeDelta::seconds(1);
        assert_eq!(backend.get(job.id, later).await.unwrap(), None);
        assert!(backend.scan(&JobFilter::all(), later).await.unwrap().is_empty());
        assert_matches!(
            backend.flag_cancel(job.id, later).await,
            Err(CoreError::NotFound { .. })
        );

        assert_eq!(backend.purge_expired(later).await.unwrap(), 1);
        assert_eq!(backend.purge_expired(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scan_filters_and_orders_newest_first() {
        let backend = MemoryRecords::new();
        let older = Job::new("sleep", json!({}));
        let mut newer = Job::new("sleep", json!({}));
        newer.created_at = older.created_at + chrono::TimeDelta::seconds(5);
        let done = Job::new("sleep", json!({}));
        for job in [&older, &newer, &done] {
            backend.insert(job).await.unwrap();
        }
        backend
            .apply(done.id, &Transition::Revoke, now(), RETENTION)
            .await
            .unwrap();

        let active = backend.scan(&JobFilter::active(), now()).await.unwrap();
        let ids: Vec<_> = active.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        let revoked = backend
            .scan(&JobFilter::with_states(&[JobState::Revoked]), now())
            .await
            .unwrap();
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].id, done.id);
    }

    #[tokio::test]
    async fn concurrent_writers_to_one_id_are_serialized() {
        let backend = Arc::new(MemoryRecords::new());
        let job = Job::new("sleep", json!({}));
        backend.insert(&job).await.unwrap();
        backend.apply(job.id, &start(), now(), RETENTION).await.unwrap();

        let id = job.id;
        let mut handles = Vec::new();
        for i in 0..16 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                backend
                    .apply(id, &Transition::Succeed(json!(i)), now(), RETENTION)
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) if outcome.changed => winners += 1,
                Ok(_) => {}
                Err(e) => assert_matches!(e, CoreError::IllegalTransition { .. }),
            }
        }
        assert_eq!(winners, 1);
    }
}
