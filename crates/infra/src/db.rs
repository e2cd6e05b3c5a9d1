//! Postgres connection pool and schema.

use std::time::Duration;

pub use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

/// Schema for job records and owner quota counters.
///
/// Statements are idempotent so `migrate` can run on every deploy.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS podcast_jobs (
        id UUID PRIMARY KEY,
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'processing', 'retrying', 'complete', 'failed')),
        source_ref TEXT NOT NULL,
        output_ref TEXT,
        title TEXT,
        duration_seconds INTEGER NOT NULL DEFAULT 0 CHECK (duration_seconds >= 0),
        requirements TEXT,
        owner_ref UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        retry_scheduled BOOLEAN NOT NULL DEFAULT FALSE,
        failure_reason TEXT,
        heartbeat_at TIMESTAMPTZ,
        deadline_at TIMESTAMPTZ,
        CHECK (status <> 'complete' OR output_ref IS NOT NULL),
        CHECK (status <> 'failed' OR output_ref IS NULL)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS podcast_jobs_processing_deadline
        ON podcast_jobs (deadline_at)
        WHERE status = 'processing'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS podcast_jobs_missing_duration
        ON podcast_jobs (created_at)
        WHERE status = 'complete' AND duration_seconds = 0
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS owner_quotas (
        owner_ref UUID PRIMARY KEY,
        podcasts_created BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Open a connection pool sized for `max_connections` concurrent users.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Apply the schema.
#[instrument(skip(pool), err)]
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "schema applied");
    Ok(())
}
