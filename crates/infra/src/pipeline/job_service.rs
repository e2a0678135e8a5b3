//! Job Service: the only writer that inserts new Job Records.
//!
//! Creation goes through the log so it is durable and retryable on its own,
//! independent of whether the enrichment stages are enabled.

use async_trait::async_trait;
use tracing::{error, info, warn};

use applyflow_core::{FeatureFlag, JobRecord, NewJob};
use applyflow_events::subject::JOBS_CREATED;
use applyflow_events::{event_type, Delivery, EventEnvelope, StatusUpdateRequest};

use super::context::PipelineContext;
use super::harness::{HandlerError, MessageHandler};

/// Consumes `jobs.create_request`.
pub struct JobCreationHandler {
    ctx: PipelineContext,
}

impl JobCreationHandler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Emit `jobs.created` when CV generation is enabled.
    ///
    /// Flag lookup and publish failures are logged; the row is already in.
    async fn announce(&self, job: &JobRecord) {
        match self.ctx.features.feature_value(FeatureFlag::CvGeneration).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job.id, "cv generation disabled, not announcing job");
                return;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "feature lookup failed, not announcing job");
                return;
            }
        }

        let published = match EventEnvelope::new(event_type::JOB_CREATED, job).to_bytes() {
            Ok(bytes) => self.ctx.log.publish(JOBS_CREATED, &bytes).await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = published {
            error!(job_id = %job.id, subject = JOBS_CREATED, error = %e, "job created but announcement failed");
        }
    }
}

#[async_trait]
impl MessageHandler for JobCreationHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let new_job =
            EventEnvelope::<NewJob>::decode(&delivery.payload, event_type::JOB_CREATION_REQUEST)?.into_data();
        new_job.validate()?;

        // Keyed by message so a redelivered request finds its first insert.
        let outcome = self.ctx.jobs.insert_job(&new_job, Some(&delivery.message_key())).await?;
        if outcome.created {
            info!(job_id = %outcome.job.id, company = %outcome.job.company, "job created");
        } else {
            info!(job_id = %outcome.job.id, "duplicate create request, reusing existing job");
        }

        self.announce(&outcome.job).await;
        Ok(())
    }
}

/// Consumes `jobs.status_update_request`.
pub struct StatusUpdateHandler {
    ctx: PipelineContext,
}

impl StatusUpdateHandler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for StatusUpdateHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let request = EventEnvelope::<StatusUpdateRequest>::decode(&delivery.payload, event_type::JOB_STATUS_UPDATE_REQUEST)?
            .into_data();
        let status = request
            .status()
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;

        self.ctx.jobs.update_job_status(request.job_id, status).await?;
        info!(job_id = %request.job_id, status = status.as_str(), "job status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use applyflow_core::{JobId, JobStatus};
    use applyflow_events::{EventLog, InMemoryEventLog};
    use chrono::Utc;

    use crate::store::{InMemoryFeatureStore, InMemoryJobStore, InMemoryPromptStore, JobRecordStore};

    fn ctx(features: InMemoryFeatureStore) -> (PipelineContext, Arc<InMemoryEventLog>, Arc<InMemoryJobStore>) {
        let log = Arc::new(InMemoryEventLog::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let ctx = PipelineContext::new(
            log.clone(),
            jobs.clone(),
            Arc::new(InMemoryPromptStore::new()),
            Arc::new(features),
        );
        (ctx, log, jobs)
    }

    async fn with_stream(log: &InMemoryEventLog) {
        log.ensure_stream(&applyflow_events::StreamConfig::new(
            "JOBS",
            vec!["jobs.*".to_string()],
            Default::default(),
        ))
        .await
        .unwrap();
    }

    fn delivery(subject: &str, id: &str, payload: Vec<u8>) -> Delivery {
        Delivery {
            stream: "JOBS".to_string(),
            durable: "job-service".to_string(),
            subject: subject.to_string(),
            message_id: id.to_string(),
            payload,
            delivery_count: 1,
            published_at: Utc::now(),
        }
    }

    fn create_request(id: &str) -> Delivery {
        let job = NewJob::new("Engineer", "Acme", "http://x", "Build things");
        let bytes = EventEnvelope::new(event_type::JOB_CREATION_REQUEST, job).to_bytes().unwrap();
        delivery("jobs.create_request", id, bytes)
    }

    #[tokio::test]
    async fn creates_job_and_announces_when_enabled() {
        let (ctx, log, jobs) = ctx(InMemoryFeatureStore::seeded());
        with_stream(&log).await;

        JobCreationHandler::new(ctx).handle(&create_request("1")).await.unwrap();

        let all = jobs.list_jobs(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].cv_generated);
        assert_eq!(all[0].score, None);
        assert_eq!(all[0].cover_letter, "");

        let announced = log.published_on(JOBS_CREATED).unwrap();
        let event = EventEnvelope::<JobRecord>::decode(&announced[0], event_type::JOB_CREATED).unwrap();
        assert_eq!(event.data().id, all[0].id);
    }

    #[tokio::test]
    async fn missing_flag_means_no_announcement() {
        let (ctx, log, jobs) = ctx(InMemoryFeatureStore::new());
        with_stream(&log).await;

        JobCreationHandler::new(ctx).handle(&create_request("1")).await.unwrap();

        assert_eq!(jobs.list_jobs(None).await.unwrap().len(), 1);
        assert!(log.published_on(JOBS_CREATED).unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivery_does_not_duplicate_rows() {
        let (ctx, log, jobs) = ctx(InMemoryFeatureStore::seeded());
        with_stream(&log).await;
        let handler = JobCreationHandler::new(ctx);

        let first = create_request("41");
        let mut again = create_request("41");
        again.delivery_count = 2;
        handler.handle(&first).await.unwrap();
        handler.handle(&again).await.unwrap();
        handler.handle(&create_request("42")).await.unwrap();

        assert_eq!(jobs.list_jobs(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_job_is_malformed() {
        let (ctx, _log, jobs) = ctx(InMemoryFeatureStore::seeded());
        let bytes = EventEnvelope::new(event_type::JOB_CREATION_REQUEST, NewJob::new("", "Acme", "", ""))
            .to_bytes()
            .unwrap();
        let err = JobCreationHandler::new(ctx)
            .handle(&delivery("jobs.create_request", "1", bytes))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
        assert!(jobs.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_update_stamps_applied_at() {
        let (ctx, _log, jobs) = ctx(InMemoryFeatureStore::seeded());
        let id = jobs
            .insert_job(&NewJob::new("Engineer", "Acme", "", ""), None)
            .await
            .unwrap()
            .job
            .id;
        let bytes = EventEnvelope::new(
            event_type::JOB_STATUS_UPDATE_REQUEST,
            StatusUpdateRequest::new(id, JobStatus::Applied),
        )
        .to_bytes()
        .unwrap();

        StatusUpdateHandler::new(ctx)
            .handle(&delivery("jobs.status_update_request", "1", bytes))
            .await
            .unwrap();

        let job = jobs.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Applied);
        assert!(job.applied_at.is_some());
    }

    #[tokio::test]
    async fn unknown_status_is_malformed() {
        let (ctx, _log, _jobs) = ctx(InMemoryFeatureStore::seeded());
        let bytes = br#"{"type":"job_status_update_request","data":{"job_id":1,"status":"archived"}}"#.to_vec();
        let err = StatusUpdateHandler::new(ctx)
            .handle(&delivery("jobs.status_update_request", "1", bytes))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
    }

    #[tokio::test]
    async fn status_update_for_unknown_job_is_retried() {
        let (ctx, _log, _jobs) = ctx(InMemoryFeatureStore::seeded());
        let bytes = EventEnvelope::new(
            event_type::JOB_STATUS_UPDATE_REQUEST,
            StatusUpdateRequest::new(JobId::new(99), JobStatus::Closed),
        )
        .to_bytes()
        .unwrap();
        let err = StatusUpdateHandler::new(ctx)
            .handle(&delivery("jobs.status_update_request", "1", bytes))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Precondition(_)));
    }
}
