//! Job orchestration: record store, queue, retry policy and the workers that
//! drive each job through the pipeline.
//!
//! - [`JobRecordStore`] owns the job record and its guarded transitions
//! - [`JobQueue`] delivers `(job, attempt)` messages at least once
//! - [`RetryPolicy`] decides whether and when a failed attempt runs again
//! - [`JobWorker`] processes one delivery; [`WorkerPool`] runs several
//! - [`DeadlineSweeper`] fails jobs whose worker vanished

pub mod backfill;
pub mod pool;
pub mod postgres;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod worker;

pub use backfill::{BackfillReport, backfill_durations};
pub use pool::{PoolConfig, WorkerPool, WorkerPoolHandle, WorkerStats};
pub use postgres::PgJobRecordStore;
pub use queue::{InMemoryJobQueue, JobQueue, QueueError};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use store::{InMemoryJobRecordStore, JobRecordStore, JobStoreError};
pub use sweeper::{DeadlineSweeper, SweepReport, SweeperHandle};
pub use types::{DeadLetterEntry, Delivery, QueueMessage, RetryPolicy};
pub use worker::{AttemptRunner, JobWorker, ProcessReport, WorkerConfig, WorkerError};
