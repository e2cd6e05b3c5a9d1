//! Job record storage.
//!
//! The record store is the only state shared between workers. Every mutation
//! is a single-row update guarded by the row's current status and attempt
//! counter, so a stale or duplicate worker can never overwrite the outcome of
//! the attempt that owns the job.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podforge_core::{CompletedJob, DomainError, FailedAttempt, Job, JobId, JobStatus};

/// Job record store abstraction.
///
/// Guarded mutations return `Ok(false)` when the guard did not match (the
/// attempt no longer owns the job), and `Err(NotFound)` when the job does not
/// exist.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert a new job record.
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically move the job into `processing` for attempt `attempt`.
    ///
    /// Returns `None` when the job is not claimable by that attempt: it is
    /// already running, finished, or the delivery is stale.
    async fn begin_attempt(
        &self,
        id: JobId,
        attempt: u32,
        deadline_at: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Refresh `heartbeat_at` while `attempt` owns the job.
    async fn heartbeat(&self, id: JobId, attempt: u32) -> Result<bool, JobStoreError>;

    /// `processing -> complete`.
    async fn complete(
        &self,
        id: JobId,
        attempt: u32,
        done: CompletedJob,
    ) -> Result<bool, JobStoreError>;

    /// `processing -> failed|retrying`.
    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        failure: FailedAttempt,
    ) -> Result<bool, JobStoreError>;

    /// `processing` jobs past their hard deadline without a heartbeat since
    /// `stale_before`.
    async fn list_stuck(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Mark a stuck job `failed`. Only applies while the job is still
    /// `processing` and past its hard deadline.
    async fn sweep_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError>;

    /// `complete` jobs whose duration was never measured.
    async fn list_missing_durations(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Record a measured duration on a `complete` job that has none.
    async fn set_duration(&self, id: JobId, duration_seconds: u32) -> Result<bool, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// In-memory job record store (for tests and single-process development).
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to the job under the write lock.
    fn mutate<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, DomainError>,
    ) -> Result<Option<T>, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| JobStoreError::storage(format!("lock poisoned: {e}")))?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        // Work on a copy so a rejected transition leaves the record untouched.
        let mut updated = job.clone();
        match f(&mut updated) {
            Ok(value) => {
                *job = updated;
                Ok(Some(value))
            }
            Err(DomainError::Conflict(_)) | Err(DomainError::InvalidTransition { .. }) => Ok(None),
            Err(other) => Err(JobStoreError::storage(other.to_string())),
        }
    }

    fn snapshot(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| JobStoreError::storage(format!("lock poisoned: {e}")))?;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|j| j.created_at);
        Ok(all)
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| JobStoreError::storage(format!("lock poisoned: {e}")))?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| JobStoreError::storage(format!("lock poisoned: {e}")))?;
        Ok(jobs.get(&id).cloned())
    }

    async fn begin_attempt(
        &self,
        id: JobId,
        attempt: u32,
        deadline_at: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.mutate(id, |job| {
            job.begin_attempt(attempt, Utc::now(), deadline_at)?;
            Ok(job.clone())
        })
    }

    async fn heartbeat(&self, id: JobId, attempt: u32) -> Result<bool, JobStoreError> {
        Ok(self
            .mutate(id, |job| job.heartbeat(attempt, Utc::now()))?
            .is_some())
    }

    async fn complete(
        &self,
        id: JobId,
        attempt: u32,
        done: CompletedJob,
    ) -> Result<bool, JobStoreError> {
        Ok(self
            .mutate(id, |job| job.complete(attempt, done, Utc::now()))?
            .is_some())
    }

    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        failure: FailedAttempt,
    ) -> Result<bool, JobStoreError> {
        Ok(self
            .mutate(id, |job| job.fail(attempt, failure, Utc::now()))?
            .is_some())
    }

    async fn list_stuck(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|j| j.is_stuck(now, stale_before))
            .collect())
    }

    async fn sweep_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError> {
        let now = Utc::now();
        Ok(self
            .mutate(id, |job| {
                if job.deadline_at.is_none_or(|d| d > now) {
                    return Err(DomainError::conflict("hard deadline not reached"));
                }
                job.sweep(reason, now)
            })?
            .is_some())
    }

    async fn list_missing_durations(&self) -> Result<Vec<Job>, JobStoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Complete && j.duration_seconds == 0)
            .filter(|j| j.output_ref.is_some())
            .collect())
    }

    async fn set_duration(&self, id: JobId, duration_seconds: u32) -> Result<bool, JobStoreError> {
        Ok(self
            .mutate(id, |job| {
                if job.status != JobStatus::Complete || job.duration_seconds != 0 {
                    return Err(DomainError::conflict("duration already known"));
                }
                job.duration_seconds = duration_seconds;
                job.updated_at = Utc::now();
                Ok(())
            })?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use podforge_core::{BlobRef, InterimStatus, OwnerId};

    fn new_job() -> Job {
        Job::new(OwnerId::new(), BlobRef::from("s3://bucket/doc.pdf"), None)
    }

    fn done() -> CompletedJob {
        CompletedJob {
            output_ref: BlobRef::from("s3://bucket/podcasts/podcast_x.mp3"),
            duration_seconds: 600,
            title: "Tides".into(),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = InMemoryJobRecordStore::new();
        let job = new_job();
        store.create(&job).await.unwrap();
        assert!(matches!(
            store.create(&job).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job.id
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn only_one_claim_wins() {
        let store = std::sync::Arc::new(InMemoryJobRecordStore::new());
        let job = new_job();
        store.create(&job).await.unwrap();
        let deadline = Utc::now() + Duration::minutes(35);
        let id = job.id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.begin_attempt(id, 0, deadline).await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn stale_attempt_cannot_overwrite_outcome() {
        let store = InMemoryJobRecordStore::new();
        let job = new_job();
        store.create(&job).await.unwrap();
        let deadline = Utc::now() + Duration::minutes(35);

        store.begin_attempt(job.id, 0, deadline).await.unwrap().unwrap();
        assert!(store
            .fail(job.id, 0, FailedAttempt::retrying("503", InterimStatus::Failed))
            .await
            .unwrap());
        store.begin_attempt(job.id, 1, deadline).await.unwrap().unwrap();

        assert!(!store.complete(job.id, 0, done()).await.unwrap());
        assert!(!store.heartbeat(job.id, 0).await.unwrap());
        assert!(store.complete(job.id, 1, done()).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
        assert_eq!(stored.duration_seconds, 600);
    }

    #[tokio::test]
    async fn missing_job_is_reported() {
        let store = InMemoryJobRecordStore::new();
        let id = JobId::new();
        assert!(matches!(
            store.begin_attempt(id, 0, Utc::now()).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sweep_requires_passed_deadline() {
        let store = InMemoryJobRecordStore::new();
        let running = new_job();
        let overdue = new_job();
        store.create(&running).await.unwrap();
        store.create(&overdue).await.unwrap();

        store
            .begin_attempt(running.id, 0, Utc::now() + Duration::minutes(35))
            .await
            .unwrap();
        store
            .begin_attempt(overdue.id, 0, Utc::now() - Duration::minutes(1))
            .await
            .unwrap();

        let now = Utc::now();
        let stuck = store.list_stuck(now, now).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, overdue.id);

        assert!(!store.sweep_failed(running.id, "lost").await.unwrap());
        assert!(store.sweep_failed(overdue.id, "lost").await.unwrap());
        let swept = store.get(overdue.id).await.unwrap().unwrap();
        assert_eq!(swept.status, JobStatus::Failed);
        assert_eq!(swept.failure_reason.as_deref(), Some("lost"));
        assert!(swept.output_ref.is_none());
    }

    #[tokio::test]
    async fn duration_is_set_once_on_complete_jobs() {
        let store = InMemoryJobRecordStore::new();
        let job = new_job();
        store.create(&job).await.unwrap();
        store
            .begin_attempt(job.id, 0, Utc::now() + Duration::minutes(35))
            .await
            .unwrap();
        store
            .complete(
                job.id,
                0,
                CompletedJob {
                    duration_seconds: 0,
                    ..done()
                },
            )
            .await
            .unwrap();

        let missing = store.list_missing_durations().await.unwrap();
        assert_eq!(missing.len(), 1);

        assert!(store.set_duration(job.id, 812).await.unwrap());
        assert!(!store.set_duration(job.id, 900).await.unwrap());
        assert!(store.list_missing_durations().await.unwrap().is_empty());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().duration_seconds, 812);
    }
}
