//! Clients for the hosted services the pipeline depends on.

pub mod elevenlabs;
pub mod gemini;
pub mod s3;

use std::time::Duration;

use podforge_pipeline::ServiceError;

pub use elevenlabs::ElevenLabsClient;
pub use gemini::GeminiClient;
pub use s3::{S3BlobStore, S3Settings};

/// Build the HTTP client shared by the service clients.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ServiceError::transport(format!("failed to build HTTP client: {e}")))
}

/// Classify a transport-level `reqwest` failure.
pub(crate) fn request_error(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout
    } else if let Some(status) = err.status() {
        ServiceError::status(status.as_u16(), err.to_string())
    } else {
        ServiceError::transport(err.to_string())
    }
}

/// Turn a non-success response into a `Status` error carrying a bounded body.
pub(crate) async fn error_status(response: reqwest::Response) -> ServiceError {
    const MAX_BODY: usize = 512;
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_BODY {
        let mut cut = MAX_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    ServiceError::status(status, body)
}

/// Join a base URL and a path without doubling the slash.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_urls() {
        assert_eq!(join_url("https://api.example.com/", "/v1/x"), "https://api.example.com/v1/x");
        assert_eq!(join_url("http://localhost:8080", "v1/x"), "http://localhost:8080/v1/x");
    }
}
