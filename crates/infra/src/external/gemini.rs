//! Text generation through the Gemini `generateContent` endpoint.

use async_trait::async_trait;
use podforge_pipeline::{ServiceError, TextGenerationService};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{error_status, join_url, request_error};

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        join_url(
            &self.base_url,
            &format!("v1beta/models/{}:generateContent", self.model),
        )
    }
}

/// Concatenated text of the first candidate.
fn candidate_text(body: &str) -> Result<String, ServiceError> {
    let response: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::invalid_response(format!("generateContent: {e}")))?;
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(ServiceError::EmptyResponse);
    };
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        debug!(finish_reason = ?candidate.finish_reason, "candidate carried no text");
        return Err(ServiceError::EmptyResponse);
    }
    Ok(text)
}

#[async_trait]
impl TextGenerationService for GeminiClient {
    #[instrument(skip_all, fields(prompt_chars = prompt.len()), err)]
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        let request = GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [RequestPart { text: prompt }],
            }],
        };
        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(error_status(response).await);
        }
        let body = response.text().await.map_err(request_error)?;
        candidate_text(&body)
    }
}
