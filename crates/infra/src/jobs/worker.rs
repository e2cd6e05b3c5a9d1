//! The job orchestrator: one delivery in, one committed outcome out.
//!
//! For each delivery the worker
//!
//! 1. claims the job for the delivered attempt (`pending|failed|retrying ->
//!    processing`) before any external call; a duplicate or stale delivery
//!    loses the claim and is acked without running
//! 2. runs the attempt under a soft deadline (cooperative cancellation) and a
//!    hard deadline (the attempt is dropped), refreshing the heartbeat
//! 3. commits `complete`, or `failed`/`retrying` plus a delayed resubmission,
//!    or a terminal `failed` (dead-lettered when retries ran out)
//! 4. acks the delivery

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podforge_core::{FailedAttempt, InterimStatus, Job, JobId, JobStatus};
use podforge_pipeline::{AttemptOutcome, Pipeline};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{JobQueue, QueueError};
use super::store::{JobRecordStore, JobStoreError};
use super::types::{Delivery, QueueMessage, RetryPolicy};
use crate::quota::QuotaLedger;

/// Runs one attempt of a job.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run_attempt(
        &self,
        job: &Job,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome;
}

#[async_trait]
impl AttemptRunner for Pipeline {
    async fn run_attempt(
        &self,
        job: &Job,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        Pipeline::run_attempt(self, job, attempt, cancel).await
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub retry: RetryPolicy,
    /// After this long the attempt is asked to stop at its next checkpoint.
    pub soft_deadline: Duration,
    /// After this long the attempt is abandoned and the job failed.
    pub hard_deadline: Duration,
    pub heartbeat_interval: Duration,
    /// Status written while a retry is pending.
    pub interim_status: InterimStatus,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            soft_deadline: Duration::from_secs(30 * 60),
            hard_deadline: Duration::from_secs(35 * 60),
            heartbeat_interval: Duration::from_secs(30),
            interim_status: InterimStatus::Failed,
        }
    }
}

/// What processing a delivery amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessReport {
    Completed {
        job_id: JobId,
        attempt: u32,
        duration_seconds: u32,
    },
    RetryScheduled {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
    },
    Failed {
        job_id: JobId,
        attempt: u32,
        reason: String,
        dead_lettered: bool,
    },
    /// The attempt could not claim the job; nothing ran.
    Duplicate { job_id: JobId, attempt: u32 },
    /// The job record no longer exists.
    Missing { job_id: JobId },
    /// The attempt ran but the record moved on (e.g. swept) before it could
    /// commit its outcome.
    Superseded { job_id: JobId, attempt: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct JobWorker {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<dyn JobQueue>,
    runner: Arc<dyn AttemptRunner>,
    quota: Arc<dyn QuotaLedger>,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn AttemptRunner>,
        quota: Arc<dyn QuotaLedger>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            runner,
            quota,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Process one delivery and ack it.
    ///
    /// An error means the outcome could not be recorded; the delivery is left
    /// unacked so the queue hands it out again.
    #[instrument(
        skip(self, delivery),
        fields(
            job_id = %delivery.message.job_id,
            attempt = delivery.message.attempt,
            delivery_count = delivery.delivery_count
        ),
        err
    )]
    pub async fn process(&self, delivery: &Delivery) -> Result<ProcessReport, WorkerError> {
        let report = self.handle(&delivery.message).await?;
        if let Err(err) = self.queue.ack(delivery).await {
            // The outcome is committed; a redelivery will lose the claim.
            warn!(error = %err, "failed to ack delivery");
        }
        Ok(report)
    }

    async fn handle(&self, message: &QueueMessage) -> Result<ProcessReport, WorkerError> {
        let (job_id, attempt) = (message.job_id, message.attempt);
        let deadline_at = after(self.config.hard_deadline);

        let job = match self.store.begin_attempt(job_id, attempt, deadline_at).await {
            Ok(Some(job)) => job,
            Ok(None) => return self.reject(message).await,
            Err(JobStoreError::NotFound(_)) => {
                warn!("job record not found, dropping delivery");
                return Ok(ProcessReport::Missing { job_id });
            }
            Err(err) => return Err(err.into()),
        };
        info!(source_ref = %job.source_ref, "attempt started");

        let heartbeat = self.spawn_heartbeat(job_id, attempt);
        let outcome = self.run_with_deadlines(&job, attempt).await;
        heartbeat.stop().await;

        let Some(outcome) = outcome else {
            let reason = format!(
                "hard deadline of {}s exceeded",
                self.config.hard_deadline.as_secs()
            );
            error!(%reason, "attempt abandoned");
            return self
                .finish_failed(message, FailedAttempt::terminal(reason), true)
                .await;
        };

        match outcome {
            AttemptOutcome::Success(output) => {
                if !self.store.complete(job_id, attempt, output.completed()).await? {
                    warn!("attempt lost the job before completing");
                    return Ok(ProcessReport::Superseded { job_id, attempt });
                }
                info!(
                    output_ref = %output.output_ref,
                    duration_seconds = output.duration_seconds,
                    title = %output.title,
                    utterances = output.utterances,
                    skipped_lines = output.skipped_lines,
                    "job complete"
                );
                if let Err(err) = self.quota.record_completion(job.owner_ref).await {
                    warn!(owner = %job.owner_ref, error = %err, "failed to record quota usage");
                }
                Ok(ProcessReport::Completed {
                    job_id,
                    attempt,
                    duration_seconds: output.duration_seconds,
                })
            }
            AttemptOutcome::Retryable(err) if self.config.retry.should_retry(attempt) => {
                let delay = self.config.retry.delay_for(attempt, message.last_delay());
                warn!(
                    error = %err,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "attempt failed, retry scheduled"
                );
                let failure = FailedAttempt::retrying(err.to_string(), self.config.interim_status);
                if !self.store.fail(job_id, attempt, failure).await? {
                    warn!("attempt lost the job before recording failure");
                    return Ok(ProcessReport::Superseded { job_id, attempt });
                }
                self.queue.enqueue(message.next_attempt(delay)).await?;
                Ok(ProcessReport::RetryScheduled {
                    job_id,
                    attempt,
                    delay,
                })
            }
            AttemptOutcome::Retryable(err) => {
                error!(error = %err, attempts = attempt + 1, "retries exhausted");
                let reason = format!("retries exhausted after {} attempts: {err}", attempt + 1);
                self.finish_failed(message, FailedAttempt::terminal(reason), true)
                    .await
            }
            AttemptOutcome::Fatal(err) => {
                error!(error = %err, "attempt failed permanently");
                self.finish_failed(message, FailedAttempt::terminal(err.to_string()), false)
                    .await
            }
        }
    }

    /// Run the attempt, cancelling it at the soft deadline and dropping it at
    /// the hard deadline. `None` means the hard deadline hit.
    async fn run_with_deadlines(&self, job: &Job, attempt: u32) -> Option<AttemptOutcome> {
        let cancel = CancellationToken::new();
        let run = self.runner.run_attempt(job, attempt, &cancel);
        let soft = tokio::time::sleep(self.config.soft_deadline);
        let hard = tokio::time::sleep(self.config.hard_deadline);
        tokio::pin!(run, soft, hard);

        loop {
            tokio::select! {
                biased;
                outcome = &mut run => return Some(outcome),
                _ = &mut hard => return None,
                _ = &mut soft, if !cancel.is_cancelled() => {
                    warn!(
                        soft_deadline_secs = self.config.soft_deadline.as_secs(),
                        "soft deadline reached, cancelling attempt"
                    );
                    cancel.cancel();
                }
            }
        }
    }

    async fn finish_failed(
        &self,
        message: &QueueMessage,
        failure: FailedAttempt,
        dead_letter: bool,
    ) -> Result<ProcessReport, WorkerError> {
        let (job_id, attempt) = (message.job_id, message.attempt);
        let reason = failure.reason.clone();
        if !self.store.fail(job_id, attempt, failure).await? {
            warn!("attempt lost the job before recording failure");
            return Ok(ProcessReport::Superseded { job_id, attempt });
        }

        let mut dead_lettered = false;
        if dead_letter {
            match self.queue.dead_letter(message, &reason).await {
                Ok(()) => dead_lettered = true,
                Err(err) => warn!(error = %err, "failed to dead-letter job"),
            }
        }
        Ok(ProcessReport::Failed {
            job_id,
            attempt,
            reason,
            dead_lettered,
        })
    }

    /// A delivery that could not claim its job.
    ///
    /// If the record shows this very attempt scheduled a retry, the
    /// resubmission may have been lost (the previous worker died between
    /// committing and enqueueing), so it is made again. Duplicate
    /// resubmissions are harmless: only one can claim the next attempt.
    async fn reject(&self, message: &QueueMessage) -> Result<ProcessReport, WorkerError> {
        let (job_id, attempt) = (message.job_id, message.attempt);
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(ProcessReport::Missing { job_id });
        };

        let awaiting_retry = matches!(job.status, JobStatus::Failed | JobStatus::Retrying)
            && job.retry_scheduled
            && job.attempts == attempt + 1;
        if awaiting_retry {
            let delay = self.config.retry.delay_for(attempt, message.last_delay());
            info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "re-submitting scheduled retry"
            );
            self.queue.enqueue(message.next_attempt(delay)).await?;
        } else {
            info!(status = %job.status, attempts = job.attempts, "duplicate delivery rejected");
        }
        Ok(ProcessReport::Duplicate { job_id, attempt })
    }

    fn spawn_heartbeat(&self, job_id: JobId, attempt: u32) -> Heartbeat {
        let stop = CancellationToken::new();
        let store = Arc::clone(&self.store);
        let interval = self.config.heartbeat_interval;
        let token = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match store.heartbeat(job_id, attempt).await {
                    Ok(true) => debug!(%job_id, attempt, "heartbeat"),
                    Ok(false) => {
                        warn!(%job_id, attempt, "heartbeat rejected, attempt no longer owns the job");
                        break;
                    }
                    Err(err) => warn!(%job_id, attempt, error = %err, "heartbeat failed"),
                }
            }
        });
        Heartbeat { stop, task }
    }
}

struct Heartbeat {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "heartbeat task failed");
        }
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
