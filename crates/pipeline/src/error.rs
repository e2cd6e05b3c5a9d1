//! Failure taxonomy for pipeline attempts.
//!
//! Every stage reports a [`StageError`]; the worker only ever asks it one
//! question, [`StageError::class`], to decide between retrying the job and
//! failing it for good.

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::PipelineOutput;

/// Error returned by an external collaborator (blob store, text generation,
/// speech synthesis).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Connection reset, DNS failure, TLS error, ...
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    /// Non-success HTTP status.
    #[error("service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("service returned an empty response")]
    EmptyResponse,

    /// The response arrived but could not be understood.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    /// The referenced object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Local file I/O while moving bytes to or from the service.
    #[error("local i/o error: {0}")]
    Io(String),
}

impl ServiceError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Whether repeating the same call later could succeed.
    ///
    /// Client errors other than request-timeout and rate-limit are permanent;
    /// so is a missing object.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Transport(_)
            | ServiceError::Timeout
            | ServiceError::EmptyResponse
            | ServiceError::InvalidResponse(_)
            | ServiceError::Io(_) => true,
            ServiceError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ServiceError::NotFound(_) => false,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(value: std::io::Error) -> Self {
        ServiceError::Io(value.to_string())
    }
}

/// The pipeline step a service call belongs to (for error context and logs).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Download,
    Summary,
    Dialogue,
    Title,
    Synthesis,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Summary => "summary",
            Stage::Dialogue => "dialogue",
            Stage::Title => "title",
            Stage::Synthesis => "synthesis",
            Stage::Publish => "publish",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failed attempt may be retried.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Error produced by one attempt of the pipeline.
#[derive(Debug, Error)]
pub enum StageError {
    /// The source is not a format the extractor understands.
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    /// The document was parsed but yielded no text.
    #[error("document contains no extractable text")]
    EmptyText,

    /// Too large a share of control characters in the extracted text.
    #[error("document text appears corrupted ({ratio_percent:.1}% control characters)")]
    CorruptText { ratio_percent: f64 },

    /// The document parser rejected the file.
    #[error("document could not be parsed: {0}")]
    Parse(String),

    #[error("invalid requirements: {0}")]
    InvalidRequirements(String),

    /// The generated script had no line matching the speaker grammar.
    #[error("generated script contains no usable dialogue ({skipped} lines skipped)")]
    NoDialogue { skipped: usize },

    #[error("{stage} failed: {source}")]
    Service {
        stage: Stage,
        #[source]
        source: ServiceError,
    },

    /// An external tool exited unsuccessfully or produced unusable output.
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("{tool} timed out after {timeout:?}")]
    ToolTimeout { tool: String, timeout: Duration },

    #[error("workspace i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The soft deadline fired while the attempt was running.
    #[error("attempt cancelled at soft deadline")]
    Cancelled,
}

impl StageError {
    pub fn service(stage: Stage, source: ServiceError) -> Self {
        Self::Service { stage, source }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Classify the error for the retry controller.
    ///
    /// Input problems can never succeed on a later attempt; everything
    /// environmental can.
    pub fn class(&self) -> ErrorClass {
        match self {
            StageError::UnsupportedFormat(_)
            | StageError::EmptyText
            | StageError::CorruptText { .. }
            | StageError::Parse(_)
            | StageError::InvalidRequirements(_)
            | StageError::NoDialogue { .. } => ErrorClass::Fatal,
            StageError::Service { source, .. } => {
                if source.is_retryable() {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            StageError::Tool { .. }
            | StageError::ToolTimeout { .. }
            | StageError::Io(_)
            | StageError::Cancelled => ErrorClass::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Result of one attempt, as seen by the retry controller.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(PipelineOutput),
    Retryable(StageError),
    Fatal(StageError),
}

impl AttemptOutcome {
    pub fn from_result(result: Result<PipelineOutput, StageError>) -> Self {
        match result {
            Ok(output) => AttemptOutcome::Success(output),
            Err(err) => match err.class() {
                ErrorClass::Retryable => AttemptOutcome::Retryable(err),
                ErrorClass::Fatal => AttemptOutcome::Fatal(err),
            },
        }
    }
}
