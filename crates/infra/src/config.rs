//! Process configuration, read from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use podforge_core::InterimStatus;
use podforge_pipeline::{PipelineConfig, RoleTable, ScriptConfig, VoiceMap};

use crate::jobs::{PoolConfig, RetryPolicy, WorkerConfig};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workspace_root: PathBuf,
    pub max_source_chars: usize,
    pub target_words: u32,
    pub analyst_voice: String,
    pub commentator_voice: String,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub tool_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

#[derive(Debug, Clone)]
pub struct DeadlineSettings {
    pub soft: Duration,
    pub hard: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub consumer_name: String,
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    /// Write `retrying` instead of `failed` while a retry is pending.
    pub report_retrying: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub google_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_model_id: String,
    pub elevenlabs_base_url: String,
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub s3_bucket: Option<String>,
    pub aws_region: String,
    pub s3_endpoint: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub pipeline: PipelineSettings,
    pub retry: RetrySettings,
    pub deadlines: DeadlineSettings,
    pub worker: WorkerSettings,
    pub services: ServiceSettings,
    pub storage: StorageSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let pipeline = PipelineSettings {
            workspace_root: env
                .string("PODFORGE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("podforge")),
            max_source_chars: env.parse("PODFORGE_MAX_SOURCE_CHARS", 100_000)?,
            target_words: env.parse("PODFORGE_TARGET_WORDS", 1_200)?,
            analyst_voice: env.or("VOICE_DOROTHY", VoiceMap::DEFAULT_ANALYST_VOICE),
            commentator_voice: env.or("VOICE_WILL", VoiceMap::DEFAULT_COMMENTATOR_VOICE),
            ffmpeg_path: env.or("FFMPEG_PATH", "ffmpeg").into(),
            ffprobe_path: env.or("FFPROBE_PATH", "ffprobe").into(),
            tool_timeout: env.secs("PODFORGE_TOOL_TIMEOUT_SECS", 600)?,
        };

        let retry = RetrySettings {
            max_retries: env.parse("PODFORGE_MAX_RETRIES", 3)?,
            base_delay: env.secs("PODFORGE_BACKOFF_BASE_SECS", 5)?,
            max_delay: env.secs("PODFORGE_BACKOFF_CAP_SECS", 600)?,
            jitter: env.parse("PODFORGE_BACKOFF_JITTER", 0.25)?,
        };
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::Invalid {
                key: "PODFORGE_BACKOFF_JITTER",
                value: retry.jitter.to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        let deadlines = DeadlineSettings {
            soft: env.secs("PODFORGE_SOFT_DEADLINE_SECS", 1_800)?,
            hard: env.secs("PODFORGE_HARD_DEADLINE_SECS", 2_100)?,
        };
        if deadlines.hard < deadlines.soft {
            return Err(ConfigError::Invalid {
                key: "PODFORGE_HARD_DEADLINE_SECS",
                value: deadlines.hard.as_secs().to_string(),
                reason: "must not be shorter than the soft deadline".to_string(),
            });
        }

        let worker = WorkerSettings {
            workers: env.parse("PODFORGE_WORKERS", 4)?,
            consumer_name: env
                .string("PODFORGE_CONSUMER_NAME")
                .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            heartbeat_interval: env.secs("PODFORGE_HEARTBEAT_SECS", 30)?,
            sweep_interval: env.secs("PODFORGE_SWEEP_INTERVAL_SECS", 60)?,
            report_retrying: env.parse("PODFORGE_REPORT_RETRYING", false)?,
        };
        if worker.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "PODFORGE_WORKERS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        let services = ServiceSettings {
            google_api_key: env.string("GOOGLE_API_KEY"),
            gemini_model: env.or("GEMINI_MODEL", "gemini-1.5-flash"),
            gemini_base_url: env.or(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com",
            ),
            elevenlabs_api_key: env.string("ELEVENLABS_API_KEY"),
            elevenlabs_model_id: env.or("ELEVENLABS_MODEL_ID", "eleven_multilingual_v2"),
            elevenlabs_base_url: env.or("ELEVENLABS_BASE_URL", "https://api.elevenlabs.io"),
            http_timeout: env.secs("PODFORGE_HTTP_TIMEOUT_SECS", 120)?,
        };

        let storage = StorageSettings {
            use_persistent_stores: env.parse("USE_PERSISTENT_STORES", false)?,
            database_url: env.string("DATABASE_URL"),
            database_max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: env.or("REDIS_URL", "redis://localhost:6379"),
            s3_bucket: env.string("AWS_S3_BUCKET_NAME"),
            aws_region: env.or("AWS_REGION", "us-east-1"),
            s3_endpoint: env.string("S3_ENDPOINT"),
            aws_access_key_id: env.string("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: env.string("AWS_SECRET_ACCESS_KEY"),
        };

        Ok(Self {
            pipeline,
            retry,
            deadlines,
            worker,
            services,
            storage,
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workspace_root: self.pipeline.workspace_root.clone(),
            max_source_chars: self.pipeline.max_source_chars,
            script: ScriptConfig {
                roles: RoleTable::default(),
                target_words: self.pipeline.target_words,
            },
            voices: VoiceMap {
                analyst: self.pipeline.analyst_voice.clone(),
                commentator: self.pipeline.commentator_voice.clone(),
            },
            ..PipelineConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry.max_retries,
            self.retry.base_delay,
            self.retry.max_delay,
        )
        .with_jitter(self.retry.jitter)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            retry: self.retry_policy(),
            soft_deadline: self.deadlines.soft,
            hard_deadline: self.deadlines.hard,
            heartbeat_interval: self.worker.heartbeat_interval,
            interim_status: if self.worker.report_retrying {
                InterimStatus::Retrying
            } else {
                InterimStatus::Failed
            },
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_name(self.worker.consumer_name.clone())
            .with_workers(self.worker.workers)
    }

    /// A heartbeat older than this, past the hard deadline, marks a lost worker.
    pub fn stale_heartbeat_after(&self) -> Duration {
        self.worker.heartbeat_interval.saturating_mul(4)
    }
}

/// Return the value of an optional setting or a `Missing` error.
pub fn require<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, ConfigError> {
    value.as_deref().ok_or(ConfigError::Missing(key))
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty trimmed value.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }
}
