//! Postgres-backed job record store.
//!
//! Every transition is one `UPDATE ... WHERE id = $1 AND <guard>` statement.
//! The guard encodes the state machine (current status and attempt counter),
//! so concurrent workers race on the row itself and exactly one wins.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (on insert) |
//! | Database (check violation) | `23514` | `Corrupt` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podforge_core::{BlobRef, CompletedJob, FailedAttempt, Job, JobId, OwnerId};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::store::{JobRecordStore, JobStoreError};

const JOB_COLUMNS: &str = "id, status, source_ref, output_ref, title, duration_seconds, \
    requirements, owner_ref, created_at, updated_at, attempts, retry_scheduled, \
    failure_reason, heartbeat_at, deadline_at";

/// Postgres-backed job record store.
#[derive(Debug, Clone)]
pub struct PgJobRecordStore {
    pool: Arc<PgPool>,
}

impl PgJobRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, id: JobId) -> Result<bool, JobStoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM podcast_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", Some(id), e))?;
        Ok(row.is_some())
    }

    /// `Ok(true)` if a guarded update touched the row, `Err(NotFound)` if the
    /// row does not exist at all.
    async fn guarded(&self, id: JobId, rows_affected: u64) -> Result<bool, JobStoreError> {
        if rows_affected == 1 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(JobStoreError::NotFound(id))
        }
    }
}

#[async_trait]
impl JobRecordStore for PgJobRecordStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO podcast_jobs (
                id, status, source_ref, output_ref, title, duration_seconds,
                requirements, owner_ref, created_at, updated_at, attempts,
                retry_scheduled, failure_reason, heartbeat_at, deadline_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.source_ref.as_str())
        .bind(job.output_ref.as_ref().map(BlobRef::as_str))
        .bind(job.title.as_deref())
        .bind(to_i32(job.duration_seconds))
        .bind(job.requirements.as_deref())
        .bind(job.owner_ref.as_uuid())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(to_i32(job.attempts))
        .bind(job.retry_scheduled)
        .bind(job.failure_reason.as_deref())
        .bind(job.heartbeat_at)
        .bind(job.deadline_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", Some(job.id), e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM podcast_jobs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", Some(id), e))?;
        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn begin_attempt(
        &self,
        id: JobId,
        attempt: u32,
        deadline_at: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE podcast_jobs
            SET status = 'processing',
                attempts = $2 + 1,
                retry_scheduled = FALSE,
                heartbeat_at = now(),
                deadline_at = $3,
                updated_at = now()
            WHERE id = $1
              AND attempts = $2
              AND (
                    (status = 'pending' AND $2 = 0)
                 OR (status IN ('failed', 'retrying') AND retry_scheduled AND $2 > 0)
              )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(to_i32(attempt))
        .bind(deadline_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("begin_attempt", Some(id), e))?;

        match row {
            Some(row) => Ok(Some(Job::try_from(row)?)),
            None if self.exists(id).await? => Ok(None),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn heartbeat(&self, id: JobId, attempt: u32) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE podcast_jobs
            SET heartbeat_at = now()
            WHERE id = $1 AND status = 'processing' AND attempts = $2 + 1
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i32(attempt))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", Some(id), e))?;
        self.guarded(id, result.rows_affected()).await
    }

    #[instrument(skip(self, done), fields(job_id = %id), err)]
    async fn complete(
        &self,
        id: JobId,
        attempt: u32,
        done: CompletedJob,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE podcast_jobs
            SET status = 'complete',
                output_ref = $3,
                duration_seconds = $4,
                title = $5,
                failure_reason = NULL,
                deadline_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND attempts = $2 + 1
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i32(attempt))
        .bind(done.output_ref.as_str())
        .bind(to_i32(done.duration_seconds))
        .bind(&done.title)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", Some(id), e))?;
        self.guarded(id, result.rows_affected()).await
    }

    #[instrument(skip(self, failure), fields(job_id = %id, status = %failure.status()), err)]
    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        failure: FailedAttempt,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE podcast_jobs
            SET status = $3,
                retry_scheduled = $4,
                failure_reason = $5,
                deadline_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND attempts = $2 + 1
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i32(attempt))
        .bind(failure.status().as_str())
        .bind(failure.retry.is_some())
        .bind(&failure.reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", Some(id), e))?;
        self.guarded(id, result.rows_affected()).await
    }

    #[instrument(skip(self), err)]
    async fn list_stuck(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM podcast_jobs
            WHERE status = 'processing'
              AND deadline_at <= $1
              AND (heartbeat_at IS NULL OR heartbeat_at <= $2)
            ORDER BY deadline_at ASC
            "#
        ))
        .bind(now)
        .bind(stale_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stuck", None, e))?;
        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn sweep_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE podcast_jobs
            SET status = 'failed',
                retry_scheduled = FALSE,
                failure_reason = $2,
                deadline_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND deadline_at <= now()
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sweep_failed", Some(id), e))?;
        self.guarded(id, result.rows_affected()).await
    }

    #[instrument(skip(self), err)]
    async fn list_missing_durations(&self) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM podcast_jobs
            WHERE status = 'complete' AND duration_seconds = 0 AND output_ref IS NOT NULL
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_missing_durations", None, e))?;
        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn set_duration(&self, id: JobId, duration_seconds: u32) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE podcast_jobs
            SET duration_seconds = $2, updated_at = now()
            WHERE id = $1 AND status = 'complete' AND duration_seconds = 0
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i32(duration_seconds))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_duration", Some(id), e))?;
        self.guarded(id, result.rows_affected()).await
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_i32(column: &str, value: i32) -> Result<u32, JobStoreError> {
    u32::try_from(value).map_err(|_| JobStoreError::Corrupt(format!("negative {column}: {value}")))
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, id: Option<JobId>, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => match id {
                    Some(id) => JobStoreError::AlreadyExists(id),
                    None => JobStoreError::Storage(msg),
                },
                // Check constraint violation
                Some("23514") => JobStoreError::Corrupt(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Internal row type for SQLx mapping.
struct JobRow {
    id: Uuid,
    status: String,
    source_ref: String,
    output_ref: Option<String>,
    title: Option<String>,
    duration_seconds: i32,
    requirements: Option<String>,
    owner_ref: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    attempts: i32,
    retry_scheduled: bool,
    failure_reason: Option<String>,
    heartbeat_at: Option<DateTime<Utc>>,
    deadline_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            source_ref: row.try_get("source_ref")?,
            output_ref: row.try_get("output_ref")?,
            title: row.try_get("title")?,
            duration_seconds: row.try_get("duration_seconds")?,
            requirements: row.try_get("requirements")?,
            owner_ref: row.try_get("owner_ref")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            attempts: row.try_get("attempts")?,
            retry_scheduled: row.try_get("retry_scheduled")?,
            failure_reason: row.try_get("failure_reason")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            deadline_at: row.try_get("deadline_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| JobStoreError::Corrupt(format!("job {}: {e}", row.id)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            status,
            source_ref: BlobRef::new(row.source_ref),
            output_ref: row.output_ref.map(BlobRef::new),
            title: row.title,
            duration_seconds: from_i32("duration_seconds", row.duration_seconds)?,
            requirements: row.requirements,
            owner_ref: OwnerId::from_uuid(row.owner_ref),
            created_at: row.created_at,
            updated_at: row.updated_at,
            attempts: from_i32("attempts", row.attempts)?,
            retry_scheduled: row.retry_scheduled,
            failure_reason: row.failure_reason,
            heartbeat_at: row.heartbeat_at,
            deadline_at: row.deadline_at,
        })
    }
}
