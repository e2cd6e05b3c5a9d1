//! Seams to the outside world.
//!
//! The pipeline never talks to a network service or parses a binary format
//! directly; it goes through these traits so the worker can inject real
//! clients and tests can inject the fakes in `testing`.

use std::path::Path;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use podforge_core::BlobRef;

use crate::error::ServiceError;

/// Audio bytes as they arrive from the synthesis service.
pub type AudioStream = BoxStream<'static, Result<Vec<u8>, ServiceError>>;

/// Durable object storage for source documents and published artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the full object behind `blob`.
    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>, ServiceError>;

    /// Store `bytes` under `key` and return a durable reference to it.
    ///
    /// Implementations must create the object with private visibility.
    /// Uploading to an existing key replaces the object.
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<BlobRef, ServiceError>;

    /// Download `blob` into a local file, returning the number of bytes written.
    async fn download_to(&self, blob: &BlobRef, path: &Path) -> Result<u64, ServiceError> {
        let bytes = self.download(blob).await?;
        tokio::fs::write(path, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    /// Upload a local file.
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<BlobRef, ServiceError> {
        let bytes = tokio::fs::read(path).await?;
        self.upload(key, bytes, content_type).await
    }
}

/// A generative text model: prompt in, text out.
#[async_trait]
pub trait TextGenerationService: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError>;
}

/// A text-to-speech service that streams encoded audio.
#[async_trait]
pub trait SpeechSynthesisService: Send + Sync {
    async fn synthesize(&self, voice_id: &str, text: &str) -> Result<AudioStream, ServiceError>;
}

/// Extracts plain text from a document file.
///
/// Parsing is CPU-bound and synchronous; callers run it on a blocking thread.
pub trait DocumentParser: Send + Sync {
    /// Lower-case file extension this parser handles (without the dot).
    fn extension(&self) -> &'static str;

    /// Whether the leading bytes of a file look like this format.
    fn sniff(&self, header: &[u8]) -> bool;

    fn extract_text(&self, path: &Path) -> Result<String, String>;
}
