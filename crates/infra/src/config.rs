//! Configuration loading and representation.
//!
//! Every setting comes from the environment (a `.env` file is loaded by the
//! binary before this runs). Parsing goes through a lookup closure so tests
//! never mutate the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use applyflow_ai::{GenerationConfig, Provider};
use applyflow_events::RetentionPolicy;

use crate::retry::RetryPolicy;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_STREAM: &str = "JOBS";
pub const DEFAULT_PDF_DIR: &str = "/app/pdfs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub redis_url: String,
    pub database_url: Option<String>,
    pub stream_name: String,
    pub retention: Duration,
    /// Optional count bound on the stream (trimmed oldest first).
    pub retention_max_messages: Option<u64>,
    pub ack_wait: Duration,
    /// Deliveries allowed before a message is dead-lettered; `None` = unbounded.
    pub max_deliver: Option<u32>,
    pub redelivery_base: Duration,
    pub redelivery_max: Duration,
    pub generation: GenerationConfig,
    pub pdf_output_dir: PathBuf,
    pub connect_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            database_url: None,
            stream_name: DEFAULT_STREAM.to_string(),
            retention: Duration::from_secs(24 * 60 * 60),
            retention_max_messages: None,
            ack_wait: Duration::from_secs(5 * 60),
            max_deliver: None,
            redelivery_base: Duration::from_secs(1),
            redelivery_max: Duration::from_secs(60),
            generation: GenerationConfig::default(),
            pdf_output_dir: PathBuf::from(DEFAULT_PDF_DIR),
            connect_attempts: 10,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let retention_hours: u64 = parse_or(&get, "APPLYFLOW_RETENTION_HOURS", 24)?;
        let ack_wait_secs: u64 = parse_or(&get, "APPLYFLOW_ACK_WAIT_SECS", 300)?;
        let base_ms: u64 = parse_or(&get, "APPLYFLOW_RETRY_BASE_MS", 1000)?;
        let max_ms: u64 = parse_or(&get, "APPLYFLOW_RETRY_MAX_MS", 60_000)?;
        let timeout_secs: u64 = parse_or(&get, "GENERATION_TIMEOUT_SECS", 120)?;

        if ack_wait_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "APPLYFLOW_ACK_WAIT_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let max_deliver = match get("APPLYFLOW_MAX_DELIVER") {
            Some(raw) => Some(parse_value::<u32>("APPLYFLOW_MAX_DELIVER", &raw)?).filter(|n| *n > 0),
            None => None,
        };

        let retention_max_messages = match get("APPLYFLOW_RETENTION_MAX_MESSAGES") {
            Some(raw) => Some(parse_value::<u64>("APPLYFLOW_RETENTION_MAX_MESSAGES", &raw)?).filter(|n| *n > 0),
            None => None,
        };

        let provider = match get("GENERATION_PROVIDER") {
            Some(raw) => Provider::from_str(&raw).map_err(|e| ConfigError::Invalid {
                key: "GENERATION_PROVIDER",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => Provider::Gemini,
        };

        let generation = GenerationConfig {
            provider,
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or(defaults.generation.gemini_model),
            ollama_url: get("OLLAMA_URL").unwrap_or(defaults.generation.ollama_url),
            ollama_model: get("OLLAMA_MODEL").unwrap_or(defaults.generation.ollama_model),
            timeout: Duration::from_secs(timeout_secs),
        };

        Ok(Self {
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            database_url: get("DATABASE_URL"),
            stream_name: get("APPLYFLOW_STREAM").unwrap_or(defaults.stream_name),
            retention: Duration::from_secs(retention_hours * 60 * 60),
            retention_max_messages,
            ack_wait: Duration::from_secs(ack_wait_secs),
            max_deliver,
            redelivery_base: Duration::from_millis(base_ms),
            redelivery_max: Duration::from_millis(max_ms.max(base_ms)),
            generation,
            pdf_output_dir: get("PDF_OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.pdf_output_dir),
            connect_attempts: parse_or(&get, "APPLYFLOW_CONNECT_ATTEMPTS", 10)?,
        })
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    /// Stream retention: max age, plus the count bound when configured.
    pub fn retention_policy(&self) -> RetentionPolicy {
        let policy = RetentionPolicy::max_age(self.retention);
        match self.retention_max_messages {
            Some(max) => policy.with_max_messages(max),
            None => policy,
        }
    }

    /// Policy for naked messages: exponential backoff, optional cap, no delay
    /// longer than the ack-wait.
    pub fn redelivery_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_deliver, self.redelivery_base, self.redelivery_max).capped_at(self.ack_wait)
    }

    /// Policy for startup connections and topology registration.
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Some(self.connect_attempts.max(1)),
            Duration::from_millis(500),
            Duration::from_secs(10),
        )
    }

    /// Ack-wait must outlast the slowest generation call or in-progress
    /// messages get redelivered to a second handler.
    pub fn warn_on_short_ack_wait(&self) {
        if self.ack_wait <= self.generation.timeout {
            warn!(
                ack_wait_secs = self.ack_wait.as_secs(),
                generation_timeout_secs = self.generation.timeout.as_secs(),
                "ack wait does not exceed generation timeout"
            );
        }
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}
