//! Infrastructure layer: job persistence and queueing, the worker that drives
//! jobs through the pipeline, service clients and configuration.

pub mod config;
pub mod db;
pub mod external;
pub mod jobs;
pub mod quota;

pub use config::{ConfigError, Settings};
pub use quota::{InMemoryQuotaLedger, PgQuotaLedger, QuotaLedger};
