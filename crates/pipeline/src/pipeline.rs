//! One attempt of the whole document-to-audio pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use podforge_core::{BlobRef, CompletedJob, Job, sanitize_requirements};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

use crate::audio::{AudioAssembler, AudioTooling};
use crate::error::{AttemptOutcome, StageError};
use crate::extract::{DEFAULT_MAX_SOURCE_CHARS, TextExtractor};
use crate::publish::{ArtifactPublisher, DEFAULT_ARTIFACT_PREFIX};
use crate::script::{ScriptConfig, ScriptGenerator};
use crate::services::{BlobStore, DocumentParser, SpeechSynthesisService, TextGenerationService};
use crate::speech::{SpeechSynthesizer, VoiceMap};
use crate::workspace::TempWorkspace;

/// What a successful attempt produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineOutput {
    pub output_ref: BlobRef,
    pub duration_seconds: u32,
    pub title: String,
    pub utterances: usize,
    pub skipped_lines: usize,
}

impl PipelineOutput {
    pub fn completed(&self) -> CompletedJob {
        CompletedJob {
            output_ref: self.output_ref.clone(),
            duration_seconds: self.duration_seconds,
            title: self.title.clone(),
        }
    }
}

/// External collaborators of the pipeline.
#[derive(Clone)]
pub struct PipelineServices {
    pub blobs: Arc<dyn BlobStore>,
    pub text: Arc<dyn TextGenerationService>,
    pub speech: Arc<dyn SpeechSynthesisService>,
    pub parser: Arc<dyn DocumentParser>,
    pub tooling: Arc<dyn AudioTooling>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parent directory of per-attempt workspaces.
    pub workspace_root: PathBuf,
    pub max_source_chars: usize,
    pub script: ScriptConfig,
    pub voices: VoiceMap,
    pub artifact_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("podforge"),
            max_source_chars: DEFAULT_MAX_SOURCE_CHARS,
            script: ScriptConfig::default(),
            voices: VoiceMap::default(),
            artifact_prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
        }
    }
}

pub struct Pipeline {
    extractor: TextExtractor,
    scripts: ScriptGenerator,
    speech: SpeechSynthesizer,
    assembler: AudioAssembler,
    publisher: ArtifactPublisher,
    workspace_root: PathBuf,
}

impl Pipeline {
    pub fn new(services: PipelineServices, config: PipelineConfig) -> Self {
        Self {
            extractor: TextExtractor::new(
                Arc::clone(&services.blobs),
                services.parser,
                config.max_source_chars,
            ),
            scripts: ScriptGenerator::new(services.text, config.script),
            speech: SpeechSynthesizer::new(services.speech, config.voices),
            assembler: AudioAssembler::new(services.tooling),
            publisher: ArtifactPublisher::new(services.blobs, config.artifact_prefix),
            workspace_root: config.workspace_root,
        }
    }

    /// Run attempt number `attempt` (0-based) for `job`.
    ///
    /// The attempt's workspace is removed before this returns, whatever the
    /// outcome. Cancelling `cancel` makes the attempt stop at the next stage
    /// boundary (or between audio chunks) with a retryable error.
    pub async fn run_attempt(
        &self,
        job: &Job,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let span = info_span!("attempt", job_id = %job.id, attempt);
        async {
            let workspace = match TempWorkspace::create(&self.workspace_root, job.id, attempt) {
                Ok(ws) => ws,
                Err(err) => return AttemptOutcome::from_result(Err(err.into())),
            };

            let result = self.execute(job, &workspace, cancel).await;

            if let Err(err) = workspace.close().await {
                warn!(error = %err, "failed to remove attempt workspace");
            }
            AttemptOutcome::from_result(result)
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        job: &Job,
        workspace: &TempWorkspace,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput, StageError> {
        let requirements = sanitize_requirements(job.requirements.as_deref())
            .map_err(|e| StageError::InvalidRequirements(e.to_string()))?;

        ensure_active(cancel)?;
        let text = self.extractor.extract(&job.source_ref, workspace).await?;

        ensure_active(cancel)?;
        let script = self
            .scripts
            .generate(&text, requirements.as_deref(), cancel)
            .await?;

        let chunk_dir = workspace.subdir("chunks").await?;
        let chunks = self
            .speech
            .synthesize_all(&script.utterances, &chunk_dir, cancel)
            .await?;

        ensure_active(cancel)?;
        let artifact = self
            .assembler
            .assemble(&chunks, &workspace.file("podcast.mp3"))
            .await?;

        ensure_active(cancel)?;
        let output_ref = self.publisher.publish(job.id, &artifact).await?;

        Ok(PipelineOutput {
            output_ref,
            duration_seconds: artifact.duration_seconds,
            title: script.title,
            utterances: script.utterances.len(),
            skipped_lines: script.skipped_lines,
        })
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), StageError> {
    if cancel.is_cancelled() {
        Err(StageError::Cancelled)
    } else {
        Ok(())
    }
}
