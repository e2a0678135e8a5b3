//! Stream and durable-consumer topology.
//!
//! Every independent downstream interest gets its own durable name, so two
//! roles listening on the same subject each see every message.

use std::time::Duration;

use tracing::info;

use applyflow_core::Stage;
use applyflow_events::subject::{
    dead_letter_pattern, COVER_GENERATE_REQUEST, COVER_GENERATED, CV_GENERATED, CV_GENERATE_REQUEST, JOBS_CREATED,
    JOBS_CREATE_REQUEST, JOBS_STATUS_UPDATE_REQUEST, PROMPTS_CREATE_REQUEST, PROMPTS_UPDATE_REQUEST,
    SCORE_GENERATE_REQUEST,
};
use applyflow_events::{ConsumerConfig, EventLog, LogError, RetentionPolicy, StreamConfig};

use crate::config::PipelineConfig;
use crate::retry::{retry_with_backoff, RetryPolicy};

pub const JOB_SERVICE: &str = "job-service";
pub const JOB_STATUS_UPDATE: &str = "job-status-update-consumer";
pub const CV_TRIGGER: &str = "job-created-consumer";
pub const CV_REQUEST: &str = "cv-generation-request-consumer";
pub const COVER_TRIGGER: &str = "job-created-cover-consumer";
pub const COVER_REQUEST: &str = "cover-generation-request-consumer";
pub const SCORE_TRIGGER: &str = "cv-score-generator-consumer";
pub const SCORE_REQUEST: &str = "score-generation-request-consumer";
pub const CV_PDF: &str = "cv-pdf-generator-consumer";
pub const COVER_PDF: &str = "cover-generated-consumer";
pub const PROMPT_CREATE: &str = "prompt-create-consumer";
pub const PROMPT_UPDATE: &str = "prompt-update-consumer";

const JOB_SERVICE_CONSUMERS: &[ConsumerSpec] = &[
    ConsumerSpec::new(JOB_SERVICE, JOBS_CREATE_REQUEST),
    ConsumerSpec::new(JOB_STATUS_UPDATE, JOBS_STATUS_UPDATE_REQUEST),
];
const PROMPT_SERVICE_CONSUMERS: &[ConsumerSpec] = &[
    ConsumerSpec::new(PROMPT_CREATE, PROMPTS_CREATE_REQUEST),
    ConsumerSpec::new(PROMPT_UPDATE, PROMPTS_UPDATE_REQUEST),
];
const CV_CONSUMERS: &[ConsumerSpec] = &[
    ConsumerSpec::new(CV_TRIGGER, JOBS_CREATED),
    ConsumerSpec::new(CV_REQUEST, CV_GENERATE_REQUEST),
];
const COVER_CONSUMERS: &[ConsumerSpec] = &[
    ConsumerSpec::new(COVER_TRIGGER, JOBS_CREATED),
    ConsumerSpec::new(COVER_REQUEST, COVER_GENERATE_REQUEST),
];
const SCORE_CONSUMERS: &[ConsumerSpec] = &[
    ConsumerSpec::new(SCORE_TRIGGER, CV_GENERATED),
    ConsumerSpec::new(SCORE_REQUEST, SCORE_GENERATE_REQUEST),
];
const PDF_CONSUMERS: &[ConsumerSpec] = &[
    ConsumerSpec::new(CV_PDF, CV_GENERATED),
    ConsumerSpec::new(COVER_PDF, COVER_GENERATED),
];

/// One long-lived process type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    JobService,
    PromptService,
    Enrichment(Stage),
    PdfSink,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::JobService,
        Role::PromptService,
        Role::Enrichment(Stage::Cv),
        Role::Enrichment(Stage::CoverLetter),
        Role::Enrichment(Stage::Score),
        Role::PdfSink,
    ];

    /// The (durable, subject) pairs this role reads.
    pub fn consumers(&self) -> &'static [ConsumerSpec] {
        match self {
            Role::JobService => JOB_SERVICE_CONSUMERS,
            Role::PromptService => PROMPT_SERVICE_CONSUMERS,
            Role::Enrichment(Stage::Cv) => CV_CONSUMERS,
            Role::Enrichment(Stage::CoverLetter) => COVER_CONSUMERS,
            Role::Enrichment(Stage::Score) => SCORE_CONSUMERS,
            Role::PdfSink => PDF_CONSUMERS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::JobService => "job-service",
            Role::PromptService => "prompt-service",
            Role::Enrichment(Stage::Cv) => "cv",
            Role::Enrichment(Stage::CoverLetter) => "cover",
            Role::Enrichment(Stage::Score) => "score",
            Role::PdfSink => "pdf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable: &'static str,
    pub subject: &'static str,
}

impl ConsumerSpec {
    pub const fn new(durable: &'static str, subject: &'static str) -> Self {
        Self { durable, subject }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    stream: StreamConfig,
    ack_wait: Duration,
}

impl Topology {
    pub fn new(stream_name: impl Into<String>, retention: RetentionPolicy, ack_wait: Duration) -> Self {
        let subjects = ["jobs.*", "cv.*", "cover.*", "score.*", "prompts.*"]
            .into_iter()
            .map(String::from)
            .chain(std::iter::once(dead_letter_pattern()))
            .collect();
        Self {
            stream: StreamConfig::new(stream_name, subjects, retention),
            ack_wait,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.stream_name.clone(), config.retention_policy(), config.ack_wait)
    }

    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    pub fn stream_name(&self) -> &str {
        &self.stream.name
    }

    pub fn consumer_config(&self, spec: &ConsumerSpec) -> ConsumerConfig {
        ConsumerConfig::new(spec.durable, spec.subject, self.ack_wait)
    }

    /// Ensure the stream and every consumer of `roles`, retrying with backoff.
    ///
    /// An error here means the process must not start.
    pub async fn register(&self, log: &dyn EventLog, roles: &[Role], policy: &RetryPolicy) -> Result<(), LogError> {
        let stream = &self.stream;
        retry_with_backoff(policy, "ensure_stream", move || log.ensure_stream(stream)).await?;

        for role in roles {
            for spec in role.consumers() {
                let config = self.consumer_config(spec);
                let config = &config;
                retry_with_backoff(policy, "ensure_consumer", move || log.ensure_consumer(&stream.name, config))
                    .await?;
                info!(role = role.name(), durable = spec.durable, subject = spec.subject, "consumer registered");
            }
        }
        Ok(())
    }
}
