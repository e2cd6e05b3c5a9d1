//! Script generation: summary, two-speaker dialogue and title.

pub mod parser;
pub mod prompt;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{ServiceError, Stage, StageError};
use crate::services::TextGenerationService;

pub use parser::{
    ParsedScript, RoleTable, ScriptLine, SkipReason, Speaker, Utterance, parse_line, parse_script,
};

/// Default target length of the dialogue, in words.
pub const DEFAULT_TARGET_WORDS: u32 = 1200;

#[derive(Debug, Clone)]
pub struct ScriptConfig {
    pub roles: RoleTable,
    pub target_words: u32,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            roles: RoleTable::default(),
            target_words: DEFAULT_TARGET_WORDS,
        }
    }
}

/// Result of the script stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScript {
    pub title: String,
    pub utterances: Vec<Utterance>,
    /// Non-empty lines that did not parse.
    pub skipped_lines: usize,
}

pub struct ScriptGenerator {
    service: Arc<dyn TextGenerationService>,
    config: ScriptConfig,
}

impl ScriptGenerator {
    pub fn new(service: Arc<dyn TextGenerationService>, config: ScriptConfig) -> Self {
        Self { service, config }
    }

    /// Run the summary, dialogue and title calls in that order.
    ///
    /// An empty reply from any call is retryable. A dialogue with no line in
    /// the speaker grammar is fatal.
    #[instrument(skip_all, fields(source_chars = source_text.len()), err)]
    pub async fn generate(
        &self,
        source_text: &str,
        requirements: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<GeneratedScript, StageError> {
        let summary = self
            .call(Stage::Summary, &prompt::summary_prompt(source_text), cancel)
            .await?;
        debug!(chars = summary.len(), "summary generated");

        let dialogue_prompt = prompt::dialogue_prompt(
            &summary,
            &self.config.roles,
            self.config.target_words,
            requirements,
        );
        let dialogue = self.call(Stage::Dialogue, &dialogue_prompt, cancel).await?;

        let parsed = parse_script(&dialogue, &self.config.roles);
        for (line_no, reason, raw) in parsed.skipped() {
            warn!(line_no, %reason, line = raw, "skipping script line");
        }
        let skipped_lines = parsed.skipped_count();
        let utterances = parsed.into_utterances();
        if utterances.is_empty() {
            return Err(StageError::NoDialogue {
                skipped: skipped_lines,
            });
        }

        let raw_title = self
            .call(Stage::Title, &prompt::title_prompt(&summary), cancel)
            .await?;
        let title = prompt::clean_title(&raw_title)
            .ok_or_else(|| StageError::service(Stage::Title, ServiceError::EmptyResponse))?;

        info!(
            utterances = utterances.len(),
            skipped_lines,
            title = %title,
            "script generated"
        );
        Ok(GeneratedScript {
            title,
            utterances,
            skipped_lines,
        })
    }

    async fn call(
        &self,
        stage: Stage,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, StageError> {
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            reply = self.service.generate(prompt) => reply,
        };
        let reply = reply.map_err(|e| StageError::service(stage, e))?;
        if reply.trim().is_empty() {
            return Err(StageError::service(stage, ServiceError::EmptyResponse));
        }
        Ok(reply)
    }
}
