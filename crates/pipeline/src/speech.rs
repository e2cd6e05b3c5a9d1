//! Speech synthesis: one audio chunk file per utterance.

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::audio::Chunk;
use crate::error::{ServiceError, Stage, StageError};
use crate::script::{Speaker, Utterance};
use crate::services::SpeechSynthesisService;

/// Voice identifiers of the synthesis service, per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceMap {
    pub analyst: String,
    pub commentator: String,
}

impl VoiceMap {
    pub const DEFAULT_ANALYST_VOICE: &'static str = "ThT5KcBeYPX3keUQqHPh";
    pub const DEFAULT_COMMENTATOR_VOICE: &'static str = "bIHbv24MWmeRgasZH58o";

    pub fn voice_for(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::Analyst => &self.analyst,
            Speaker::Commentator => &self.commentator,
        }
    }
}

impl Default for VoiceMap {
    fn default() -> Self {
        Self {
            analyst: Self::DEFAULT_ANALYST_VOICE.to_string(),
            commentator: Self::DEFAULT_COMMENTATOR_VOICE.to_string(),
        }
    }
}

/// File name of the chunk at `index`; zero-padded so names sort in order.
pub fn chunk_file_name(index: usize) -> String {
    format!("chunk_{index:05}.mp3")
}

pub struct SpeechSynthesizer {
    service: Arc<dyn SpeechSynthesisService>,
    voices: VoiceMap,
}

impl SpeechSynthesizer {
    pub fn new(service: Arc<dyn SpeechSynthesisService>, voices: VoiceMap) -> Self {
        Self { service, voices }
    }

    /// Synthesize every utterance in order into `dir`.
    ///
    /// Audio is written as it streams in; a whole chunk is never held in
    /// memory. Any failed or empty chunk fails the stage.
    #[instrument(skip_all, fields(utterances = utterances.len()), err)]
    pub async fn synthesize_all(
        &self,
        utterances: &[Utterance],
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chunk>, StageError> {
        let mut chunks = Vec::with_capacity(utterances.len());
        for (index, utterance) in utterances.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let path = dir.join(chunk_file_name(index));
            let bytes = self.synthesize_one(utterance, &path, cancel).await?;
            debug!(index, bytes, speaker = ?utterance.speaker, "chunk written");
            chunks.push(Chunk { index, path, bytes });
        }

        info!(
            chunks = chunks.len(),
            bytes = chunks.iter().map(|c| c.bytes).sum::<u64>(),
            "speech synthesized"
        );
        Ok(chunks)
    }

    async fn synthesize_one(
        &self,
        utterance: &Utterance,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, StageError> {
        let voice = self.voices.voice_for(utterance.speaker);
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            stream = self.service.synthesize(voice, &utterance.text) => {
                stream.map_err(|e| StageError::service(Stage::Synthesis, e))?
            }
        };

        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StageError::Cancelled),
                next = stream.next() => next,
            };
            let Some(piece) = next else {
                break;
            };
            let piece = piece.map_err(|e| StageError::service(Stage::Synthesis, e))?;
            file.write_all(&piece).await?;
            written += piece.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(StageError::service(
                Stage::Synthesis,
                ServiceError::EmptyResponse,
            ));
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSpeechService;

    fn utterances() -> Vec<Utterance> {
        vec![
            Utterance {
                speaker: Speaker::Analyst,
                text: "Tides are long waves.".into(),
            },
            Utterance {
                speaker: Speaker::Commentator,
                text: "How long?".into(),
            },
        ]
    }

    #[tokio::test]
    async fn writes_one_chunk_per_utterance_with_role_voice() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeSpeechService::new());
        let synth = SpeechSynthesizer::new(service.clone(), VoiceMap::default());

        let chunks = synth
            .synthesize_all(&utterances(), dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].path, dir.path().join("chunk_00000.mp3"));
        assert_eq!(chunks[1].index, 1);
        for chunk in &chunks {
            let on_disk = std::fs::metadata(&chunk.path).unwrap().len();
            assert_eq!(on_disk, chunk.bytes);
            assert!(chunk.bytes > 0);
        }

        let calls = service.calls();
        assert_eq!(calls[0].0, VoiceMap::DEFAULT_ANALYST_VOICE);
        assert_eq!(calls[1].0, VoiceMap::DEFAULT_COMMENTATOR_VOICE);
        assert_eq!(calls[1].1, "How long?");
    }

    #[tokio::test]
    async fn empty_audio_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeSpeechService::new().with_silence());
        let synth = SpeechSynthesizer::new(service, VoiceMap::default());

        let err = synth
            .synthesize_all(&utterances(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Service {
                stage: Stage::Synthesis,
                source: ServiceError::EmptyResponse
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failure_mid_stream_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeSpeechService::new());
        service.fail_mid_stream_after(1, ServiceError::transport("connection reset"));
        let synth = SpeechSynthesizer::new(service, VoiceMap::default());

        let err = synth
            .synthesize_all(&utterances(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn quota_error_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeSpeechService::new());
        service.fail_next(1, ServiceError::status(401, "quota_exceeded"));
        let synth = SpeechSynthesizer::new(service, VoiceMap::default());

        let err = synth
            .synthesize_all(&utterances(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn chunk_names_sort_in_order() {
        let mut names: Vec<_> = [10, 2, 100, 0].into_iter().map(chunk_file_name).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["chunk_00000.mp3", "chunk_00002.mp3", "chunk_00010.mp3", "chunk_00100.mp3"]
        );
    }
}
