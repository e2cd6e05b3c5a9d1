//! Uploading the finished artifact.

use std::sync::Arc;

use podforge_core::{BlobRef, JobId};
use tracing::{info, instrument};

use crate::audio::Artifact;
use crate::error::{Stage, StageError};
use crate::services::BlobStore;

pub const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

/// Default key prefix for published artifacts.
pub const DEFAULT_ARTIFACT_PREFIX: &str = "podcasts";

pub struct ArtifactPublisher {
    blobs: Arc<dyn BlobStore>,
    prefix: String,
}

impl ArtifactPublisher {
    pub fn new(blobs: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            blobs,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Storage key for a job's artifact. Depends only on the job id, so a
    /// retried attempt overwrites rather than duplicates.
    pub fn artifact_key(&self, job_id: JobId) -> String {
        if self.prefix.is_empty() {
            format!("podcast_{job_id}.mp3")
        } else {
            format!("{}/podcast_{job_id}.mp3", self.prefix)
        }
    }

    #[instrument(skip(self, artifact), fields(job_id = %job_id), err)]
    pub async fn publish(&self, job_id: JobId, artifact: &Artifact) -> Result<BlobRef, StageError> {
        let key = self.artifact_key(job_id);
        let blob = self
            .blobs
            .upload_file(&key, &artifact.path, AUDIO_CONTENT_TYPE)
            .await
            .map_err(|e| StageError::service(Stage::Publish, e))?;
        info!(output_ref = %blob, "artifact published");
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::testing::InMemoryBlobStore;

    fn artifact(dir: &std::path::Path, bytes: &[u8]) -> Artifact {
        let path = dir.join("podcast.mp3");
        std::fs::write(&path, bytes).unwrap();
        Artifact {
            path,
            duration_seconds: 1,
        }
    }

    #[tokio::test]
    async fn key_is_deterministic_and_reupload_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(InMemoryBlobStore::new());
        let publisher = ArtifactPublisher::new(blobs.clone(), "podcasts/");
        let job_id = JobId::new();

        let first = publisher.publish(job_id, &artifact(dir.path(), b"v1")).await.unwrap();
        let second = publisher.publish(job_id, &artifact(dir.path(), b"v2")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(publisher.artifact_key(job_id), format!("podcasts/podcast_{job_id}.mp3"));
        assert_eq!(blobs.object_count(), 1);
        assert_eq!(blobs.get(&second).unwrap(), b"v2");
        assert_eq!(blobs.content_type(&second).as_deref(), Some(AUDIO_CONTENT_TYPE));
    }

    #[tokio::test]
    async fn upload_failure_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs.fail_uploads(1, ServiceError::status(503, "slow down"));
        let publisher = ArtifactPublisher::new(blobs, DEFAULT_ARTIFACT_PREFIX);

        let err = publisher
            .publish(JobId::new(), &artifact(dir.path(), b"x"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
