//! Blob storage on S3 (or an S3-compatible endpoint such as MinIO).

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use podforge_core::BlobRef;
use podforge_pipeline::{BlobStore, ServiceError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint; enables path-style addressing.
    pub endpoint: Option<String>,
    /// Static credentials. Without them the client is built with the
    /// SDK's default configuration only.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

pub struct S3BlobStore {
    client: Client,
    bucket: String,
    endpoint: Option<String>,
}

impl S3BlobStore {
    pub fn new(settings: S3Settings) -> Self {
        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(settings.region.clone()))
            .behavior_version_latest();

        if let (Some(key_id), Some(secret)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            let credentials = Credentials::new(key_id, secret, None, None, "podforge");
            builder = builder.credentials_provider(credentials);
        }
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
            endpoint: settings.endpoint,
        }
    }

    /// Public-style URL of `key`; the object itself stays private.
    fn reference(&self, key: &str) -> BlobRef {
        match &self.endpoint {
            Some(endpoint) => BlobRef::new(format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.bucket,
                key
            )),
            None => BlobRef::new(format!("https://{}.s3.amazonaws.com/{key}", self.bucket)),
        }
    }

    /// Object key behind a reference produced by this store or by the upload
    /// flow: `s3://bucket/key`, a virtual-hosted or path-style URL, or a bare
    /// key.
    fn key_of(&self, blob: &BlobRef) -> Result<String, ServiceError> {
        let raw = blob.as_str();
        let invalid = || ServiceError::NotFound(format!("{raw} is not in bucket {}", self.bucket));

        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').ok_or_else(invalid)?;
            return if bucket == self.bucket && !key.is_empty() {
                Ok(key.to_string())
            } else {
                Err(invalid())
            };
        }

        let Some(rest) = raw
            .strip_prefix("https://")
            .or_else(|| raw.strip_prefix("http://"))
        else {
            return Ok(raw.trim_start_matches('/').to_string());
        };
        let (host, path) = rest.split_once('/').ok_or_else(invalid)?;
        let virtual_host = host.starts_with(&format!("{}.s3.", self.bucket));
        let key = if virtual_host {
            Some(path)
        } else {
            path.strip_prefix(&format!("{}/", self.bucket))
        };
        match key {
            Some(key) if !key.is_empty() => Ok(key.to_string()),
            _ => Err(invalid()),
        }
    }

    async fn get(&self, key: &str) -> Result<ByteStream, ServiceError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(e, key))?;
        Ok(object.body)
    }

    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<BlobRef, ServiceError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::Private)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| sdk_error(e, key))?;
        debug!(key, "object stored");
        Ok(self.reference(key))
    }
}

fn sdk_error<E>(err: SdkError<E, HttpResponse>, key: &str) -> ServiceError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(ctx) => match ctx.raw().status().as_u16() {
            404 => ServiceError::NotFound(key.to_string()),
            status => ServiceError::status(status, DisplayErrorContext(&err).to_string()),
        },
        SdkError::TimeoutError(_) => ServiceError::Timeout,
        _ => ServiceError::transport(DisplayErrorContext(&err).to_string()),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(blob = %blob), err)]
    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>, ServiceError> {
        let key = self.key_of(blob)?;
        let bytes = self
            .get(&key)
            .await?
            .collect()
            .await
            .map_err(|e| ServiceError::transport(format!("reading {key}: {e}")))?;
        Ok(bytes.to_vec())
    }

    #[instrument(skip(self, bytes), fields(bytes = bytes.len()), err)]
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<BlobRef, ServiceError> {
        self.put(key, ByteStream::from(bytes), content_type).await
    }

    /// Streams the object body to `path` instead of buffering it.
    #[instrument(skip(self), fields(blob = %blob), err)]
    async fn download_to(&self, blob: &BlobRef, path: &Path) -> Result<u64, ServiceError> {
        let key = self.key_of(blob)?;
        let mut body = self.get(&key).await?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(piece) = body.next().await {
            let piece = piece.map_err(|e| ServiceError::transport(format!("reading {key}: {e}")))?;
            file.write_all(&piece).await?;
            written += piece.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    #[instrument(skip(self), err)]
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<BlobRef, ServiceError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| ServiceError::Io(format!("{}: {e}", path.display())))?;
        self.put(key, body, content_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: Option<&str>) -> S3BlobStore {
        S3BlobStore::new(S3Settings {
            bucket: "podforge-media".to_string(),
            region: "us-east-1".to_string(),
            endpoint: endpoint.map(str::to_string),
            access_key_id: Some("test".to_string()),
            secret_access_key: Some("test".to_string()),
        })
    }

    #[test]
    fn references_round_trip_to_keys() {
        for s in [store(None), store(Some("http://localhost:9000/"))] {
            let blob = s.reference("podcasts/podcast_1.mp3");
            assert_eq!(s.key_of(&blob).unwrap(), "podcasts/podcast_1.mp3");
        }
        assert_eq!(
            store(None).reference("podcasts/a.mp3").as_str(),
            "https://podforge-media.s3.amazonaws.com/podcasts/a.mp3"
        );
    }

    #[test]
    fn accepts_the_reference_shapes_clients_send() {
        let s = store(None);
        for (raw, key) in [
            ("s3://podforge-media/uploads/a.pdf", "uploads/a.pdf"),
            ("https://podforge-media.s3.us-east-1.amazonaws.com/uploads/a.pdf", "uploads/a.pdf"),
            ("https://s3.amazonaws.com/podforge-media/uploads/a.pdf", "uploads/a.pdf"),
            ("uploads/a.pdf", "uploads/a.pdf"),
        ] {
            assert_eq!(s.key_of(&BlobRef::from(raw)).unwrap(), key, "{raw}");
        }
    }

    #[test]
    fn rejects_other_buckets() {
        let s = store(None);
        for raw in [
            "s3://elsewhere/uploads/a.pdf",
            "https://elsewhere.s3.amazonaws.com/uploads/a.pdf",
            "s3://podforge-media/",
        ] {
            let key = s.key_of(&BlobRef::from(raw));
            assert!(matches!(key, Err(ServiceError::NotFound(_))), "{raw}");
        }
    }
}
