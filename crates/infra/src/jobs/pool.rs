//! A pool of concurrent queue consumers feeding one [`JobWorker`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::worker::{JobWorker, ProcessReport};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent consumers.
    pub workers: usize,
    /// How long one dequeue call may block
    pub poll_wait: Duration,
    /// Back-off after a queue or store error
    pub error_backoff: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            name: "podforge-worker".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub rejected_duplicates: u64,
    pub errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, report: &ProcessReport) {
        match report {
            ProcessReport::Completed { .. } => self.succeeded += 1,
            ProcessReport::RetryScheduled { .. } => self.retried += 1,
            ProcessReport::Failed { dead_lettered, .. } => {
                self.failed += 1;
                if *dead_lettered {
                    self.dead_lettered += 1;
                }
            }
            ProcessReport::Duplicate { .. }
            | ProcessReport::Missing { .. }
            | ProcessReport::Superseded { .. } => self.rejected_duplicates += 1,
        }
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop taking new deliveries and wait for in-flight attempts to finish.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("consumers already stopped");
        }
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task panicked");
            }
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct WorkerPool {
    worker: Arc<JobWorker>,
    queue: Arc<dyn JobQueue>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(worker: Arc<JobWorker>, queue: Arc<dyn JobQueue>, config: PoolConfig) -> Self {
        Self {
            worker,
            queue,
            config,
        }
    }

    /// Spawn the consumers on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let joins = (0..self.config.workers.max(1))
            .map(|index| {
                let consumer = Consumer {
                    name: format!("{}-{index}", self.config.name),
                    worker: self.worker.clone(),
                    queue: self.queue.clone(),
                    config: self.config.clone(),
                    stats: stats.clone(),
                };
                tokio::spawn(consumer.run(shutdown_rx.clone()))
            })
            .collect();

        info!(pool = %self.config.name, workers = self.config.workers, "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

struct Consumer {
    name: String,
    worker: Arc<JobWorker>,
    queue: Arc<dyn JobQueue>,
    config: PoolConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Consumer {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(consumer = %self.name, "consumer started");
        while !*shutdown.borrow() {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.queue.dequeue(self.config.poll_wait) => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => {
                    lock(&self.stats).errors += 1;
                    error!(consumer = %self.name, error = %err, "failed to dequeue");
                    tokio::time::sleep(self.config.error_backoff).await;
                    continue;
                }
            };

            {
                let mut s = lock(&self.stats);
                s.processed += 1;
                s.current_running += 1;
            }

            // In-flight attempts run to completion; shutdown only stops intake.
            let result = self.worker.process(&delivery).await;

            let failure = {
                let mut s = lock(&self.stats);
                s.current_running = s.current_running.saturating_sub(1);
                match result {
                    Ok(report) => {
                        s.record(&report);
                        None
                    }
                    Err(err) => {
                        s.errors += 1;
                        Some(err)
                    }
                }
            };
            if let Some(err) = failure {
                warn!(
                    consumer = %self.name,
                    job_id = %delivery.message.job_id,
                    error = %err,
                    "delivery left for redelivery"
                );
                tokio::time::sleep(self.config.error_backoff).await;
            }
        }
        debug!(consumer = %self.name, "consumer stopped");
    }
}
