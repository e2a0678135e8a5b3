//! Durable event log abstraction (mechanics only).
//!
//! A **stream** retains messages published on a set of subject patterns for a
//! bounded window. A **durable consumer** is a named cursor over one stream,
//! selected by a subject filter:
//!
//! - Two different durable names over the same subject each see every message
//!   (fan-out). Each independent downstream interest gets its own name.
//! - Two fetchers using the same durable name share one cursor; each message
//!   goes to one of them (horizontal scaling, ordering is lost).
//! - A delivered message stays in flight until it is acked, naked or
//!   terminated. If none of those happens within the consumer's ack-wait the
//!   log redelivers it.
//!
//! Delivery is **at-least-once**: handlers must tolerate reprocessing.
//!
//! Registration calls (`ensure_stream`, `ensure_consumer`) are idempotent
//! create-or-update and are meant to be called by every process at startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("consumer {durable} not found on stream {stream}")]
    ConsumerNotFound { stream: String, durable: String },

    #[error("no stream accepts subject {0}")]
    NoStreamForSubject(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown message id: {0}")]
    UnknownMessage(String),

    #[error("internal lock poisoned")]
    Poisoned,
}

/// How long a stream keeps messages. Both limits may apply at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_messages: Option<u64>,
}

impl RetentionPolicy {
    pub fn max_age(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
            max_messages: None,
        }
    }

    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.max_messages = Some(max_messages);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>, retention: RetentionPolicy) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention,
        }
    }

    pub fn accepts(&self, subject: &str) -> bool {
        self.subjects
            .iter()
            .any(|pattern| crate::subject::subject_matches(pattern, subject))
    }

    pub fn validate(&self) -> Result<(), LogError> {
        if self.name.trim().is_empty() {
            return Err(LogError::InvalidConfig("stream name is empty".to_string()));
        }
        if self.subjects.is_empty() {
            return Err(LogError::InvalidConfig(format!(
                "stream {} has no subjects",
                self.name
            )));
        }
        for pattern in &self.subjects {
            crate::subject::validate_pattern(pattern)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    pub fn new(durable_name: impl Into<String>, filter_subject: impl Into<String>, ack_wait: Duration) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject: filter_subject.into(),
            ack_wait,
        }
    }

    pub fn validate(&self) -> Result<(), LogError> {
        if self.durable_name.trim().is_empty() {
            return Err(LogError::InvalidConfig("durable name is empty".to_string()));
        }
        if self.ack_wait.is_zero() {
            return Err(LogError::InvalidConfig(format!(
                "consumer {} has zero ack wait",
                self.durable_name
            )));
        }
        crate::subject::validate_pattern(&self.filter_subject)
    }
}

/// One delivery of one message to one durable consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stream: String,
    pub durable: String,
    pub subject: String,
    /// Log-assigned id, stable across redeliveries of the same message.
    pub message_id: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub published_at: DateTime<Utc>,
}

impl Delivery {
    /// Identity of the underlying message, stable across redeliveries.
    pub fn message_key(&self) -> String {
        format!("{}/{}/{}", self.stream, self.subject, self.message_id)
    }
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Create or update a stream. Existing messages are kept.
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<(), LogError>;

    /// Create or update a durable consumer. An existing durable keeps its cursor.
    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<(), LogError>;

    /// Append a message. Returns the log-assigned message id.
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<String, LogError>;

    /// Wait up to `max_wait` for the next delivery on a durable consumer.
    async fn fetch(&self, stream: &str, durable: &str, max_wait: Duration) -> Result<Option<Delivery>, LogError>;

    /// Processing finished; never redeliver.
    async fn ack(&self, delivery: &Delivery) -> Result<(), LogError>;

    /// Processing failed; redeliver after `delay`.
    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), LogError>;

    /// The message can never be processed; drop it without redelivery.
    async fn term(&self, delivery: &Delivery) -> Result<(), LogError>;
}

#[async_trait]
impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<(), LogError> {
        (**self).ensure_stream(config).await
    }

    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<(), LogError> {
        (**self).ensure_consumer(stream, config).await
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<String, LogError> {
        (**self).publish(subject, payload).await
    }

    async fn fetch(&self, stream: &str, durable: &str, max_wait: Duration) -> Result<Option<Delivery>, LogError> {
        (**self).fetch(stream, durable, max_wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), LogError> {
        (**self).ack(delivery).await
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), LogError> {
        (**self).nak(delivery, delay).await
    }

    async fn term(&self, delivery: &Delivery) -> Result<(), LogError> {
        (**self).term(delivery).await
    }
}
