//! `podforge-core` — domain building blocks for the document-to-audio pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the `Job` record and its status state machine, and input
//! sanitization rules.

pub mod error;
pub mod id;
pub mod job;
pub mod requirements;

pub use error::{DomainError, DomainResult};
pub use id::{BlobRef, JobId, OwnerId};
pub use job::{CompletedJob, FailedAttempt, InterimStatus, Job, JobStatus};
pub use requirements::{MAX_REQUIREMENTS_CHARS, sanitize_requirements};
