//! The job record and its status state machine.
//!
//! ```text
//! pending ──► processing ──► complete
//!                 │
//!                 ├──► failed ───(retry scheduled)──► processing
//!                 └──► retrying ─────────────────────► processing
//! ```
//!
//! `complete` is terminal. `failed` is terminal unless the attempt that wrote it
//! also scheduled a retry; `retrying` only appears when the worker is configured
//! to expose scheduled retries distinctly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{BlobRef, JobId, OwnerId};

/// Externally observable job status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created by the API, waiting for a worker.
    Pending,
    /// An attempt is running.
    Processing,
    /// An attempt failed and another one is scheduled.
    Retrying,
    /// Artifact published, `output_ref` set.
    Complete,
    /// Unrecoverable failure (or failure with a pending retry, see module docs).
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Retrying => "retrying",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "retrying" => Ok(JobStatus::Retrying),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Status shown to pollers while a retry is scheduled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterimStatus {
    /// Report `failed` until the next attempt picks the job up.
    #[default]
    Failed,
    /// Report `retrying`.
    Retrying,
}

impl From<InterimStatus> for JobStatus {
    fn from(value: InterimStatus) -> Self {
        match value {
            InterimStatus::Failed => JobStatus::Failed,
            InterimStatus::Retrying => JobStatus::Retrying,
        }
    }
}

/// Fields committed together on `processing -> complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedJob {
    pub output_ref: BlobRef,
    pub duration_seconds: u32,
    pub title: String,
}

/// Outcome of a failed attempt, committed on `processing -> failed|retrying`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub reason: String,
    /// `Some` when another attempt has been scheduled.
    pub retry: Option<InterimStatus>,
}

impl FailedAttempt {
    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry: None,
        }
    }

    pub fn retrying(reason: impl Into<String>, interim: InterimStatus) -> Self {
        Self {
            reason: reason.into(),
            retry: Some(interim),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.retry.map(JobStatus::from).unwrap_or(JobStatus::Failed)
    }
}

/// One document-to-audio conversion request and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub source_ref: BlobRef,
    pub output_ref: Option<BlobRef>,
    pub title: Option<String>,
    pub duration_seconds: u32,
    /// Raw customization text; sanitized by the pipeline before use.
    pub requirements: Option<String>,
    pub owner_ref: OwnerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of attempts started so far.
    pub attempts: u32,
    /// Set when the last failed attempt scheduled another one.
    pub retry_scheduled: bool,
    pub failure_reason: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Hard deadline of the running attempt.
    pub deadline_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new `pending` job.
    pub fn new(owner_ref: OwnerId, source_ref: BlobRef, requirements: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            status: JobStatus::Pending,
            source_ref,
            output_ref: None,
            title: None,
            duration_seconds: 0,
            requirements,
            owner_ref,
            created_at: now,
            updated_at: now,
            attempts: 0,
            retry_scheduled: false,
            failure_reason: None,
            heartbeat_at: None,
            deadline_at: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Whether attempt number `attempt` (0-based) may claim this job.
    ///
    /// The first attempt needs a `pending` job; later ones need the previous
    /// attempt to have failed with a retry scheduled. Comparing `attempts`
    /// rejects duplicate and stale deliveries.
    pub fn can_begin_attempt(&self, attempt: u32) -> bool {
        if self.attempts != attempt {
            return false;
        }
        match self.status {
            JobStatus::Pending => attempt == 0,
            JobStatus::Failed | JobStatus::Retrying => attempt > 0 && self.retry_scheduled,
            JobStatus::Processing | JobStatus::Complete => false,
        }
    }

    /// `pending|failed|retrying -> processing`.
    pub fn begin_attempt(
        &mut self,
        attempt: u32,
        now: DateTime<Utc>,
        deadline_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.can_begin_attempt(attempt) {
            return Err(DomainError::conflict(format!(
                "job {} cannot start attempt {} (status {}, attempts {})",
                self.id, attempt, self.status, self.attempts
            )));
        }
        self.status = JobStatus::Processing;
        self.attempts = attempt + 1;
        self.retry_scheduled = false;
        self.heartbeat_at = Some(now);
        self.deadline_at = Some(deadline_at);
        self.updated_at = now;
        Ok(())
    }

    /// Whether `attempt` currently owns the `processing` state.
    pub fn is_running_attempt(&self, attempt: u32) -> bool {
        self.status == JobStatus::Processing && self.attempts == attempt + 1
    }

    fn ensure_running(&self, attempt: u32, to: JobStatus) -> DomainResult<()> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::transition(self.status, to));
        }
        if self.attempts != attempt + 1 {
            return Err(DomainError::conflict(format!(
                "attempt {} is stale for job {} (attempts {})",
                attempt, self.id, self.attempts
            )));
        }
        Ok(())
    }

    pub fn heartbeat(&mut self, attempt: u32, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running(attempt, JobStatus::Processing)?;
        self.heartbeat_at = Some(now);
        Ok(())
    }

    /// `processing -> complete`, setting output, duration and title together.
    pub fn complete(
        &mut self,
        attempt: u32,
        done: CompletedJob,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_running(attempt, JobStatus::Complete)?;
        self.status = JobStatus::Complete;
        self.output_ref = Some(done.output_ref);
        self.duration_seconds = done.duration_seconds;
        self.title = Some(done.title);
        self.failure_reason = None;
        self.deadline_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `processing -> failed|retrying`.
    pub fn fail(
        &mut self,
        attempt: u32,
        failure: FailedAttempt,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let to = failure.status();
        self.ensure_running(attempt, to)?;
        self.status = to;
        self.retry_scheduled = failure.retry.is_some();
        self.failure_reason = Some(failure.reason);
        self.deadline_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Reconciliation path: a `processing` job whose worker vanished.
    pub fn sweep(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::transition(self.status, JobStatus::Failed));
        }
        self.status = JobStatus::Failed;
        self.retry_scheduled = false;
        self.failure_reason = Some(reason.into());
        self.deadline_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Past its hard deadline with no recent heartbeat.
    pub fn is_stuck(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.deadline_at.is_some_and(|d| d <= now)
            && self.heartbeat_at.is_none_or(|h| h <= stale_before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_job() -> Job {
        Job::new(OwnerId::new(), BlobRef::from("s3://bucket/doc.pdf"), None)
    }

    fn done() -> CompletedJob {
        CompletedJob {
            output_ref: BlobRef::from("s3://bucket/podcasts/podcast_1.mp3"),
            duration_seconds: 754,
            title: "The Quiet Economics of Tides".to_string(),
        }
    }

    #[test]
    fn happy_path_sets_output_fields_together() {
        let mut job = test_job();
        let now = Utc::now();

        job.begin_attempt(0, now, now + Duration::minutes(35)).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert!(job.output_ref.is_none());
        assert_eq!(job.duration_seconds, 0);

        job.complete(0, done(), now).unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.output_ref.is_some());
        assert_eq!(job.duration_seconds, 754);
        assert_eq!(job.title.as_deref(), Some("The Quiet Economics of Tides"));
        assert!(job.deadline_at.is_none());
    }

    #[test]
    fn duplicate_delivery_cannot_claim_twice() {
        let mut job = test_job();
        let now = Utc::now();

        job.begin_attempt(0, now, now).unwrap();
        let err = job.begin_attempt(0, now, now).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn terminal_failure_blocks_further_attempts() {
        let mut job = test_job();
        let now = Utc::now();

        job.begin_attempt(0, now, now).unwrap();
        job.fail(0, FailedAttempt::terminal("empty text"), now).unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.output_ref.is_none());
        assert!(!job.can_begin_attempt(1));
        assert!(!job.can_begin_attempt(0));
    }

    #[test]
    fn scheduled_retry_reopens_failed_job_once() {
        let mut job = test_job();
        let now = Utc::now();

        job.begin_attempt(0, now, now).unwrap();
        job.fail(0, FailedAttempt::retrying("503", InterimStatus::Failed), now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.retry_scheduled);

        // A stale redelivery of attempt 0 is rejected; attempt 1 is accepted.
        assert!(!job.can_begin_attempt(0));
        job.begin_attempt(1, now, now).unwrap();
        assert_eq!(job.attempts, 2);
        assert!(!job.retry_scheduled);

        job.complete(1, done(), now).unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.failure_reason.is_none());
    }

    #[test]
    fn retrying_interim_status_is_exposed_when_requested() {
        let mut job = test_job();
        let now = Utc::now();

        job.begin_attempt(0, now, now).unwrap();
        job.fail(0, FailedAttempt::retrying("timeout", InterimStatus::Retrying), now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert!(job.can_begin_attempt(1));
    }

    #[test]
    fn complete_is_terminal() {
        let mut job = test_job();
        let now = Utc::now();

        job.begin_attempt(0, now, now).unwrap();
        job.complete(0, done(), now).unwrap();

        assert!(matches!(
            job.fail(0, FailedAttempt::terminal("late"), now),
            Err(DomainError::InvalidTransition { .. })
        ));
        assert!(job.sweep("deadline", now).is_err());
        assert!(!job.can_begin_attempt(1));
    }

    #[test]
    fn stale_attempt_cannot_complete() {
        let mut job = test_job();
        let now = Utc::now();

        job.begin_attempt(0, now, now).unwrap();
        job.fail(0, FailedAttempt::retrying("503", InterimStatus::Failed), now)
            .unwrap();
        job.begin_attempt(1, now, now).unwrap();

        assert!(matches!(job.complete(0, done(), now), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn stuck_detection_uses_deadline_and_heartbeat() {
        let mut job = test_job();
        let start = Utc::now();
        job.begin_attempt(0, start, start + Duration::minutes(35)).unwrap();

        let later = start + Duration::minutes(40);
        assert!(job.is_stuck(later, later - Duration::minutes(2)));

        // A fresh heartbeat keeps it alive.
        job.heartbeat(0, later - Duration::seconds(30)).unwrap();
        assert!(!job.is_stuck(later, later - Duration::minutes(2)));

        // Before the deadline it is never stuck.
        assert!(!job.is_stuck(start + Duration::minutes(10), later));
    }

    #[test]
    fn status_parses_from_storage_strings() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Retrying,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }
}
