//! Reconciliation of jobs whose worker disappeared.
//!
//! A worker that crashes mid-attempt leaves its job `processing` forever. The
//! sweeper fails such jobs once their hard deadline has passed and their
//! heartbeat has gone quiet, and dead-letters them for inspection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::queue::JobQueue;
use super::store::{JobRecordStore, JobStoreError};
use super::types::QueueMessage;

pub const SWEPT_REASON: &str = "worker lost: hard deadline passed without a heartbeat";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub swept: usize,
}

pub struct DeadlineSweeper {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<dyn JobQueue>,
    /// A heartbeat older than this counts as silence.
    stale_after: Duration,
}

impl DeadlineSweeper {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<dyn JobQueue>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            stale_after,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn sweep_once(&self) -> Result<SweepReport, JobStoreError> {
        let now = Utc::now();
        let stale_before = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(now);

        let stuck = self.store.list_stuck(now, stale_before).await?;
        let mut report = SweepReport {
            examined: stuck.len(),
            swept: 0,
        };

        for job in stuck {
            if !self.store.sweep_failed(job.id, SWEPT_REASON).await? {
                // Finished or heartbeated since it was listed.
                continue;
            }
            report.swept += 1;
            warn!(job_id = %job.id, attempts = job.attempts, "swept stuck job");

            let message = QueueMessage {
                attempt: job.attempts.saturating_sub(1),
                ..QueueMessage::first(job.id)
            };
            if let Err(err) = self.queue.dead_letter(&message, SWEPT_REASON).await {
                warn!(job_id = %job.id, error = %err, "failed to dead-letter swept job");
            }
        }

        if report.swept > 0 {
            info!(swept = report.swept, "sweep finished");
        }
        Ok(report)
    }

    /// Sweep every `interval` until shut down.
    pub fn spawn(self, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = self.sweep_once().await {
                    error!(error = %err, "sweep failed");
                }
            }
        });
        SweeperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("sweeper already stopped");
        }
        if let Err(err) = self.join.await {
            error!(error = %err, "sweeper task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::store::InMemoryJobRecordStore;
    use podforge_core::{BlobRef, Job, JobStatus, OwnerId};

    async fn started_job(store: &InMemoryJobRecordStore, deadline_in: chrono::Duration) -> Job {
        let job = Job::new(OwnerId::new(), BlobRef::from("mem://doc.pdf"), None);
        store.create(&job).await.unwrap();
        store
            .begin_attempt(job.id, 0, Utc::now() + deadline_in)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn sweeps_jobs_past_deadline_and_dead_letters_them() {
        let store = Arc::new(InMemoryJobRecordStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let stuck = started_job(&store, chrono::Duration::seconds(-5)).await;
        let healthy = started_job(&store, chrono::Duration::minutes(30)).await;

        let sweeper = DeadlineSweeper::new(store.clone(), queue.clone(), Duration::ZERO);
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { examined: 1, swept: 1 });

        let swept = store.get(stuck.id).await.unwrap().unwrap();
        assert_eq!(swept.status, JobStatus::Failed);
        assert!(!swept.retry_scheduled);
        assert_eq!(swept.failure_reason.as_deref(), Some(SWEPT_REASON));
        assert_eq!(
            store.get(healthy.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.job_id, stuck.id);
        assert_eq!(dead[0].message.attempt, 0);
    }

    #[tokio::test]
    async fn recent_heartbeat_keeps_job_alive() {
        let store = Arc::new(InMemoryJobRecordStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let job = started_job(&store, chrono::Duration::seconds(-5)).await;

        let sweeper = DeadlineSweeper::new(store.clone(), queue.clone(), Duration::from_secs(600));
        assert_eq!(sweeper.sweep_once().await.unwrap().swept, 0);
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn swept_attempt_cannot_commit_afterwards() {
        let store = Arc::new(InMemoryJobRecordStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let job = started_job(&store, chrono::Duration::seconds(-5)).await;

        DeadlineSweeper::new(store.clone(), queue, Duration::ZERO)
            .sweep_once()
            .await
            .unwrap();
        assert!(!store.heartbeat(job.id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_until_shut_down() {
        let store = Arc::new(InMemoryJobRecordStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let job = started_job(&store, chrono::Duration::seconds(-5)).await;

        let handle = DeadlineSweeper::new(store.clone(), queue.clone(), Duration::ZERO)
            .spawn(Duration::from_millis(10));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.dead_letters().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("sweeper shut down");

        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(queue.dead_letters().len(), 1);
    }
}
