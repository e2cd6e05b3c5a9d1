//! Speech synthesis through the ElevenLabs text-to-speech endpoint.

use async_trait::async_trait;
use futures_util::StreamExt;
use podforge_pipeline::{AudioStream, ServiceError, SpeechSynthesisService};
use serde::Serialize;
use tracing::instrument;

use super::{error_status, join_url, request_error};

/// MP3, 44.1 kHz, 128 kbit/s: every chunk of a program shares the encoding so
/// they can be concatenated without re-encoding.
pub const OUTPUT_FORMAT: &str = "mp3_44100_128";

#[derive(Debug, Clone)]
pub struct ElevenLabsClient {
    http: reqwest::Client,
    api_key: String,
    model_id: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

impl ElevenLabsClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        model_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model_id: model_id.into(),
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, voice_id: &str) -> String {
        join_url(&self.base_url, &format!("v1/text-to-speech/{voice_id}"))
    }
}

#[async_trait]
impl SpeechSynthesisService for ElevenLabsClient {
    #[instrument(skip(self, text), fields(text_chars = text.len()), err)]
    async fn synthesize(&self, voice_id: &str, text: &str) -> Result<AudioStream, ServiceError> {
        let response = self
            .http
            .post(self.endpoint(voice_id))
            .query(&[("output_format", OUTPUT_FORMAT)])
            .header("xi-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&SpeechRequest {
                text,
                model_id: &self.model_id,
            })
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(error_status(response).await);
        }

        Ok(response
            .bytes_stream()
            .map(|piece| piece.map(|b| b.to_vec()).map_err(request_error))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_names_the_voice() {
        let client = ElevenLabsClient::new(
            reqwest::Client::new(),
            "key",
            "eleven_multilingual_v2",
            "https://api.elevenlabs.io",
        );
        assert_eq!(
            client.endpoint("ThT5KcBeYPX3keUQqHPh"),
            "https://api.elevenlabs.io/v1/text-to-speech/ThT5KcBeYPX3keUQqHPh"
        );
    }

    #[test]
    fn request_body_carries_text_and_model() {
        let body = serde_json::to_value(SpeechRequest {
            text: "Welcome back.",
            model_id: "eleven_multilingual_v2",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"text": "Welcome back.", "model_id": "eleven_multilingual_v2"})
        );
    }
}
