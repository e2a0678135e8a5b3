//! Request producers.
//!
//! Any front end (HTTP, CLI, tests) turns user intent into log messages
//! through [`PipelineProducer`]; nothing here touches the stores.

use std::sync::Arc;

use tracing::{debug, instrument};

use applyflow_core::{DomainError, JobId, JobStatus, NewJob, PromptDraft, PromptId, Stage};
use applyflow_events::subject::{
    JOBS_CREATE_REQUEST, JOBS_STATUS_UPDATE_REQUEST, PROMPTS_CREATE_REQUEST, PROMPTS_UPDATE_REQUEST,
};
use applyflow_events::{event_type, EventEnvelope, EventLog, GenerateRequest, LogError, PromptUpdate, StatusUpdateRequest};

use super::enrichment::EnrichmentStage;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("request rejected: {0}")]
    Invalid(#[from] DomainError),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Log(#[from] LogError),
}

#[derive(Clone)]
pub struct PipelineProducer {
    log: Arc<dyn EventLog>,
}

impl PipelineProducer {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// Ask the Job Service to insert `job`. Returns the log message id.
    pub async fn request_job_creation(&self, job: &NewJob) -> Result<String, PublishError> {
        job.validate()?;
        self.publish(JOBS_CREATE_REQUEST, event_type::JOB_CREATION_REQUEST, job).await
    }

    /// Ask `stage` to (re)generate its output for `job_id`, optionally with
    /// a specific stored prompt instead of the stage default.
    pub async fn request_generation(
        &self,
        stage: Stage,
        job_id: JobId,
        prompt_id: Option<PromptId>,
    ) -> Result<String, PublishError> {
        let route = EnrichmentStage::of(stage).request;
        self.publish(route.subject, route.event_type, &GenerateRequest::new(job_id, prompt_id))
            .await
    }

    pub async fn request_status_update(&self, job_id: JobId, status: JobStatus) -> Result<String, PublishError> {
        self.publish(
            JOBS_STATUS_UPDATE_REQUEST,
            event_type::JOB_STATUS_UPDATE_REQUEST,
            &StatusUpdateRequest::new(job_id, status),
        )
        .await
    }

    pub async fn request_prompt_creation(&self, draft: &PromptDraft) -> Result<String, PublishError> {
        draft.validate()?;
        self.publish(PROMPTS_CREATE_REQUEST, event_type::PROMPT_CREATION_REQUEST, draft)
            .await
    }

    pub async fn request_prompt_update(&self, id: PromptId, draft: PromptDraft) -> Result<String, PublishError> {
        draft.validate()?;
        self.publish(
            PROMPTS_UPDATE_REQUEST,
            event_type::PROMPT_UPDATE_REQUEST,
            &PromptUpdate { id, draft },
        )
        .await
    }

    #[instrument(skip(self, data), err)]
    async fn publish<T: serde::Serialize>(
        &self,
        subject: &str,
        event_type: &str,
        data: T,
    ) -> Result<String, PublishError> {
        let bytes = EventEnvelope::new(event_type, data).to_bytes()?;
        let id = self.log.publish(subject, &bytes).await?;
        debug!(subject, message_id = %id, "request published");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use applyflow_events::subject::SCORE_GENERATE_REQUEST;
    use applyflow_events::InMemoryEventLog;

    use crate::pipeline::topology::{Role, Topology};
    use crate::retry::RetryPolicy;

    async fn producer() -> (PipelineProducer, Arc<InMemoryEventLog>) {
        let log = Arc::new(InMemoryEventLog::new());
        Topology::new("JOBS", Default::default(), Duration::from_secs(30))
            .register(log.as_ref(), &Role::ALL, &RetryPolicy::fixed(1, Duration::ZERO))
            .await
            .unwrap();
        (PipelineProducer::new(log.clone()), log)
    }

    #[tokio::test]
    async fn generation_request_goes_to_the_stage_subject() {
        let (producer, log) = producer().await;
        producer
            .request_generation(Stage::Score, JobId::new(5), Some(PromptId::new(2)))
            .await
            .unwrap();

        let published = log.published_on(SCORE_GENERATE_REQUEST).unwrap();
        assert_eq!(published.len(), 1);
        let request =
            EventEnvelope::<GenerateRequest>::decode(&published[0], event_type::SCORE_GENERATION_REQUEST).unwrap();
        assert_eq!(request.data().job_id().unwrap(), JobId::new(5));
        assert_eq!(request.data().prompt_id, Some(PromptId::new(2)));
    }

    #[tokio::test]
    async fn invalid_job_is_rejected_before_publishing() {
        let (producer, log) = producer().await;
        let err = producer
            .request_job_creation(&NewJob::new("  ", "Acme", "", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Invalid(_)));
        assert!(log.published_on(JOBS_CREATE_REQUEST).unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_update_carries_wire_status() {
        let (producer, log) = producer().await;
        producer
            .request_status_update(JobId::new(3), JobStatus::Applied)
            .await
            .unwrap();

        let published = log.published_on(JOBS_STATUS_UPDATE_REQUEST).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(value["type"], "job_status_update_request");
        assert_eq!(value["data"]["job_id"], 3);
        assert_eq!(value["data"]["status"], "applied");
    }

    #[tokio::test]
    async fn publish_without_stream_fails() {
        let producer = PipelineProducer::new(Arc::new(InMemoryEventLog::new()));
        let err = producer
            .request_prompt_creation(&PromptDraft::new("p", "text"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Log(_)));
    }
}
