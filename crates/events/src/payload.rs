//! Typed payloads carried in the `data` field of the envelope.
//!
//! `*.created` and `*.generated` events carry a full `JobRecord` snapshot
//! and need no dedicated type.

use serde::{Deserialize, Serialize};

use applyflow_core::{DomainResult, JobId, JobStatus, PromptDraft, PromptId};

/// Envelope `type` tags.
pub mod event_type {
    pub const JOB_CREATION_REQUEST: &str = "job_creation_request";
    pub const JOB_CREATED: &str = "job_created";
    pub const JOB_STATUS_UPDATE_REQUEST: &str = "job_status_update_request";
    pub const CV_GENERATION_REQUEST: &str = "cv_generation_request";
    pub const CV_GENERATED: &str = "cv_generated";
    pub const COVER_GENERATION_REQUEST: &str = "cover_generation_request";
    pub const COVER_GENERATED: &str = "cover_generated";
    pub const SCORE_GENERATION_REQUEST: &str = "score_generation_request";
    pub const PROMPT_CREATION_REQUEST: &str = "prompt_creation_request";
    pub const PROMPT_UPDATE_REQUEST: &str = "prompt_update_request";
    pub const DEAD_LETTER: &str = "dead_letter";
}

/// Explicit (re)generation request for one stage.
///
/// `job_id` travels as a decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<PromptId>,
}

impl GenerateRequest {
    pub fn new(job_id: JobId, prompt_id: Option<PromptId>) -> Self {
        Self {
            job_id: job_id.to_string(),
            prompt_id,
        }
    }

    pub fn job_id(&self) -> DomainResult<JobId> {
        self.job_id.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub job_id: JobId,
    pub status: String,
}

impl StatusUpdateRequest {
    pub fn new(job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_id,
            status: status.as_str().to_string(),
        }
    }

    pub fn status(&self) -> DomainResult<JobStatus> {
        self.status.parse()
    }
}

/// Replace an existing prompt's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptUpdate {
    pub id: PromptId,
    #[serde(flatten)]
    pub draft: PromptDraft,
}

/// A message whose redelivery budget ran out, parked for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub subject: String,
    pub durable: String,
    pub deliveries: u32,
    pub reason: String,
    /// Original payload; JSON when it parsed, otherwise a lossy string.
    pub payload: serde_json::Value,
}

impl DeadLetter {
    pub fn new(
        subject: impl Into<String>,
        durable: impl Into<String>,
        deliveries: u32,
        reason: impl Into<String>,
        raw: &[u8],
    ) -> Self {
        let payload = serde_json::from_slice(raw)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(raw).into_owned()));
        Self {
            subject: subject.into(),
            durable: durable.into(),
            deliveries,
            reason: reason.into(),
            payload,
        }
    }
}
