//! Wiring of stores, queues and service clients from [`Settings`].

use std::sync::Arc;

use anyhow::Context;
use podforge_infra::config::require;
use podforge_infra::external::{self, ElevenLabsClient, GeminiClient, S3BlobStore, S3Settings};
use podforge_infra::jobs::{
    InMemoryJobQueue, InMemoryJobRecordStore, JobQueue, JobRecordStore, PgJobRecordStore,
    RedisJobQueue,
};
use podforge_infra::{InMemoryQuotaLedger, PgQuotaLedger, QuotaLedger, Settings, db};
use podforge_pipeline::{
    AudioTooling, BlobStore, FfmpegTooling, PdfTextParser, Pipeline, PipelineServices,
};
use tracing::{info, warn};

/// How long an unacked Redis delivery waits beyond the hard deadline before
/// another consumer may claim it.
const RECLAIM_GRACE: std::time::Duration = std::time::Duration::from_secs(120);

pub struct Backends {
    pub store: Arc<dyn JobRecordStore>,
    pub queue: Arc<dyn JobQueue>,
    pub quota: Arc<dyn QuotaLedger>,
}

pub async fn backends(settings: &Settings) -> anyhow::Result<Backends> {
    if !settings.storage.use_persistent_stores {
        warn!("USE_PERSISTENT_STORES is off; jobs live only in this process");
        return Ok(Backends {
            store: Arc::new(InMemoryJobRecordStore::new()),
            queue: Arc::new(
                InMemoryJobQueue::new()
                    .with_visibility_timeout(settings.deadlines.hard + RECLAIM_GRACE),
            ),
            quota: Arc::new(InMemoryQuotaLedger::new()),
        });
    }

    let pool = connect(settings).await?;
    let queue = RedisJobQueue::new(
        &settings.storage.redis_url,
        settings.worker.consumer_name.clone(),
    )?
    .with_reclaim_after(settings.deadlines.hard + RECLAIM_GRACE);
    queue
        .ensure_consumer_group()
        .context("failed to create the Redis consumer group")?;
    info!(redis_url = %settings.storage.redis_url, "using Postgres and Redis Streams");

    Ok(Backends {
        store: Arc::new(PgJobRecordStore::new(pool.clone())),
        queue: Arc::new(queue),
        quota: Arc::new(PgQuotaLedger::new(pool)),
    })
}

async fn connect(settings: &Settings) -> anyhow::Result<db::PgPool> {
    let url = require(&settings.storage.database_url, "DATABASE_URL")?;
    db::connect(url, settings.storage.database_max_connections)
        .await
        .context("failed to connect to Postgres")
}

pub async fn migrate(settings: &Settings) -> anyhow::Result<()> {
    let pool = connect(settings).await?;
    db::migrate(&pool).await.context("schema migration failed")?;
    Ok(())
}

pub fn blob_store(settings: &Settings) -> anyhow::Result<Arc<dyn BlobStore>> {
    let storage = &settings.storage;
    let bucket = require(&storage.s3_bucket, "AWS_S3_BUCKET_NAME")?;
    Ok(Arc::new(S3BlobStore::new(S3Settings {
        bucket: bucket.to_string(),
        region: storage.aws_region.clone(),
        endpoint: storage.s3_endpoint.clone(),
        access_key_id: storage.aws_access_key_id.clone(),
        secret_access_key: storage.aws_secret_access_key.clone(),
    })))
}

pub fn audio_tooling(settings: &Settings) -> Arc<dyn AudioTooling> {
    Arc::new(FfmpegTooling::new(
        settings.pipeline.ffmpeg_path.clone(),
        settings.pipeline.ffprobe_path.clone(),
        settings.pipeline.tool_timeout,
    ))
}

pub fn pipeline(settings: &Settings) -> anyhow::Result<Pipeline> {
    let services = &settings.services;
    let http = external::http_client(services.http_timeout)?;

    let text = GeminiClient::new(
        http.clone(),
        require(&services.google_api_key, "GOOGLE_API_KEY")?,
        services.gemini_model.clone(),
        services.gemini_base_url.clone(),
    );
    let speech = ElevenLabsClient::new(
        http,
        require(&services.elevenlabs_api_key, "ELEVENLABS_API_KEY")?,
        services.elevenlabs_model_id.clone(),
        services.elevenlabs_base_url.clone(),
    );

    Ok(Pipeline::new(
        PipelineServices {
            blobs: blob_store(settings)?,
            text: Arc::new(text),
            speech: Arc::new(speech),
            parser: Arc::new(PdfTextParser),
            tooling: audio_tooling(settings),
        },
        settings.pipeline_config(),
    ))
}
