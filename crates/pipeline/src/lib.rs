//! `podforge-pipeline` — the stages that turn one source document into one
//! published audio artifact.
//!
//! A job attempt runs strictly in order:
//!
//! 1. [`extract::TextExtractor`] downloads and parses the document
//! 2. [`script::ScriptGenerator`] produces a summary, a two-speaker script and a title
//! 3. [`speech::SpeechSynthesizer`] streams one audio chunk per utterance to disk
//! 4. [`audio::AudioAssembler`] concatenates the chunks and measures the result
//! 5. [`publish::ArtifactPublisher`] uploads the artifact under a job-derived key
//!
//! Every intermediate file lives in a [`workspace::TempWorkspace`] owned by the
//! attempt. External collaborators are reached only through the traits in
//! [`services`], so callers inject real clients or, with the `testing`
//! feature, the fakes from `testing`.

pub mod audio;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod publish;
pub mod script;
pub mod services;
pub mod speech;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod workspace;

pub use audio::{Artifact, AudioAssembler, AudioTooling, Chunk, FfmpegTooling};
pub use error::{AttemptOutcome, ErrorClass, ServiceError, Stage, StageError};
pub use extract::{PdfTextParser, TextExtractor};
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutput, PipelineServices};
pub use publish::ArtifactPublisher;
pub use script::{
    GeneratedScript, ParsedScript, RoleTable, ScriptConfig, ScriptGenerator, ScriptLine,
    SkipReason, Speaker, Utterance,
};
pub use services::{
    AudioStream, BlobStore, DocumentParser, SpeechSynthesisService, TextGenerationService,
};
pub use speech::{SpeechSynthesizer, VoiceMap};
pub use workspace::TempWorkspace;
