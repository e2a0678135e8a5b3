//! Generic enrichment stage worker, instantiated once per [`Stage`].
//!
//! Each stage reads two cursors:
//!
//! - a trigger subject carrying a full Job Record snapshot (the automatic
//!   path), and
//! - a `*.generate_request` subject carrying `{job_id, prompt_id?}` (explicit
//!   regeneration), which always re-reads the record from the store.
//!
//! Both paths share [`EnrichmentWorker::enrich`]: resolve the prompt, check
//! the stage's readiness, call the generator, write the stage's own fields
//! and announce the result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use applyflow_ai::Generator;
use applyflow_core::{DomainResult, FeatureFlag, JobId, JobRecord, PromptId, Stage, StageProgress};
use applyflow_events::subject::{
    COVER_GENERATE_REQUEST, COVER_GENERATED, CV_GENERATED, CV_GENERATE_REQUEST, JOBS_CREATED, SCORE_GENERATE_REQUEST,
};
use applyflow_events::{event_type, Delivery, EventEnvelope, GenerateRequest};

use crate::store::write_stage_output;

use super::context::PipelineContext;
use super::harness::{HandlerError, MessageHandler};
use super::topology::{COVER_REQUEST, COVER_TRIGGER, CV_REQUEST, CV_TRIGGER, SCORE_REQUEST, SCORE_TRIGGER};

/// Subject and type tag of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub subject: &'static str,
    pub event_type: &'static str,
}

/// The data that distinguishes one enrichment stage from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentStage {
    pub stage: Stage,
    pub trigger: Route,
    pub trigger_durable: &'static str,
    pub request: Route,
    pub request_durable: &'static str,
    /// Announced after a successful write; `None` for the last stage.
    pub follow_on: Option<Route>,
    /// Flag gating the automatic path. Explicit requests always run.
    pub trigger_flag: Option<FeatureFlag>,
}

impl EnrichmentStage {
    pub fn of(stage: Stage) -> Self {
        match stage {
            Stage::Cv => Self {
                stage,
                trigger: Route {
                    subject: JOBS_CREATED,
                    event_type: event_type::JOB_CREATED,
                },
                trigger_durable: CV_TRIGGER,
                request: Route {
                    subject: CV_GENERATE_REQUEST,
                    event_type: event_type::CV_GENERATION_REQUEST,
                },
                request_durable: CV_REQUEST,
                follow_on: Some(Route {
                    subject: CV_GENERATED,
                    event_type: event_type::CV_GENERATED,
                }),
                trigger_flag: None,
            },
            Stage::CoverLetter => Self {
                stage,
                trigger: Route {
                    subject: JOBS_CREATED,
                    event_type: event_type::JOB_CREATED,
                },
                trigger_durable: COVER_TRIGGER,
                request: Route {
                    subject: COVER_GENERATE_REQUEST,
                    event_type: event_type::COVER_GENERATION_REQUEST,
                },
                request_durable: COVER_REQUEST,
                follow_on: Some(Route {
                    subject: COVER_GENERATED,
                    event_type: event_type::COVER_GENERATED,
                }),
                trigger_flag: None,
            },
            Stage::Score => Self {
                stage,
                trigger: Route {
                    subject: CV_GENERATED,
                    event_type: event_type::CV_GENERATED,
                },
                trigger_durable: SCORE_TRIGGER,
                request: Route {
                    subject: SCORE_GENERATE_REQUEST,
                    event_type: event_type::SCORE_GENERATION_REQUEST,
                },
                request_durable: SCORE_REQUEST,
                follow_on: None,
                trigger_flag: Some(FeatureFlag::ScoreGeneration),
            },
        }
    }
}

pub struct EnrichmentWorker {
    spec: EnrichmentStage,
    ctx: PipelineContext,
    generator: Arc<dyn Generator>,
    progress: Mutex<HashMap<JobId, StageProgress>>,
}

impl EnrichmentWorker {
    pub fn new(stage: Stage, ctx: PipelineContext, generator: Arc<dyn Generator>) -> Arc<Self> {
        Arc::new(Self {
            spec: EnrichmentStage::of(stage),
            ctx,
            generator,
            progress: Mutex::new(HashMap::new()),
        })
    }

    pub fn spec(&self) -> &EnrichmentStage {
        &self.spec
    }

    /// This process's view of the stage for `job_id`.
    pub fn progress(&self, job_id: JobId) -> StageProgress {
        self.progress
            .lock()
            .ok()
            .and_then(|p| p.get(&job_id).copied())
            .unwrap_or_default()
    }

    fn transition(
        &self,
        job_id: JobId,
        step: fn(StageProgress) -> DomainResult<StageProgress>,
    ) -> Result<StageProgress, HandlerError> {
        let mut progress = self
            .progress
            .lock()
            .map_err(|_| HandlerError::Collaborator("stage progress lock poisoned".to_string()))?;
        let current = progress.get(&job_id).copied().unwrap_or_default();
        let next = step(current)?;
        progress.insert(job_id, next);
        debug!(stage = %self.spec.stage, job_id = %job_id, from = ?current, to = ?next, "stage progress");
        Ok(next)
    }

    pub fn trigger_handler(self: &Arc<Self>) -> TriggerHandler {
        TriggerHandler(self.clone())
    }

    pub fn request_handler(self: &Arc<Self>) -> RequestHandler {
        RequestHandler(self.clone())
    }

    async fn resolve_prompt(&self, prompt_id: Option<PromptId>) -> Result<String, HandlerError> {
        let stage = self.spec.stage;
        if let Some(id) = prompt_id {
            return match self.ctx.prompts.get_prompt(id).await? {
                Some(prompt) => Ok(prompt.prompt),
                None => Err(HandlerError::Precondition(format!("prompt {} not found", id))),
            };
        }
        Ok(match self.ctx.prompts.default_prompt(stage).await? {
            Some(prompt) => prompt.prompt,
            None => stage.fallback_prompt().to_string(),
        })
    }

    /// Run the stage for `job` and return the updated snapshot.
    ///
    /// A second request for the same job while one is generating is deferred
    /// as a precondition failure.
    #[instrument(skip(self, job), fields(stage = %self.spec.stage, job_id = %job.id), err)]
    pub async fn enrich(&self, mut job: JobRecord, prompt_id: Option<PromptId>) -> Result<JobRecord, HandlerError> {
        let prompt_text = self.resolve_prompt(prompt_id).await?;
        self.spec.stage.check_ready(&job)?;

        self.transition(job.id, StageProgress::begin)?;
        if let Err(err) = self.generate_and_write(&prompt_text, &mut job).await {
            self.transition(job.id, StageProgress::retry)?;
            return Err(err);
        }
        self.transition(job.id, StageProgress::complete)?;
        info!(stage = %self.spec.stage, job_id = %job.id, "stage output written");

        self.announce(&job).await;
        Ok(job)
    }

    async fn generate_and_write(&self, prompt_text: &str, job: &mut JobRecord) -> Result<(), HandlerError> {
        let stage = self.spec.stage;
        let prompt = stage.compose_prompt(prompt_text, job);
        let generated = self.generator.generate(&prompt).await?;
        let output = stage
            .interpret(generated)
            .map_err(|e| HandlerError::Collaborator(format!("unusable {} output: {}", stage, e)))?;

        write_stage_output(self.ctx.jobs.as_ref(), job.id, &output).await?;
        output
            .apply_to(job)
            .map_err(|e| HandlerError::Collaborator(e.to_string()))
    }

    /// Publish the follow-on event. The write already happened, so a failure
    /// here is only logged.
    async fn announce(&self, job: &JobRecord) {
        let Some(route) = self.spec.follow_on else {
            return;
        };
        let published = match EventEnvelope::new(route.event_type, job).to_bytes() {
            Ok(bytes) => self.ctx.log.publish(route.subject, &bytes).await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = published {
            error!(
                stage = %self.spec.stage,
                job_id = %job.id,
                subject = route.subject,
                error = %e,
                "follow-on publish failed after successful write"
            );
        }
    }

    async fn trigger_enabled(&self) -> Result<bool, HandlerError> {
        match self.spec.trigger_flag {
            Some(flag) => Ok(self.ctx.features.feature_value(flag).await?),
            None => Ok(true),
        }
    }
}

/// Automatic path: a full Job Record snapshot on the trigger subject.
pub struct TriggerHandler(Arc<EnrichmentWorker>);

#[async_trait]
impl MessageHandler for TriggerHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let worker = &self.0;
        let envelope = EventEnvelope::<JobRecord>::decode(&delivery.payload, worker.spec.trigger.event_type)?;

        if !worker.trigger_enabled().await? {
            info!(
                stage = %worker.spec.stage,
                job_id = %envelope.data().id,
                "automatic generation disabled, skipping"
            );
            return Ok(());
        }

        worker.enrich(envelope.into_data(), None).await.map(|_| ())
    }
}

/// Explicit path: `{job_id, prompt_id?}`, re-reading the current record.
pub struct RequestHandler(Arc<EnrichmentWorker>);

#[async_trait]
impl MessageHandler for RequestHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let worker = &self.0;
        let request = EventEnvelope::<GenerateRequest>::decode(&delivery.payload, worker.spec.request.event_type)?
            .into_data();
        let job_id = request
            .job_id()
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;

        let job = match worker.ctx.jobs.get_job(job_id).await? {
            Some(job) => job,
            None => {
                warn!(stage = %worker.spec.stage, job_id = %job_id, "generate request for unknown job");
                return Err(HandlerError::Precondition(format!("job {} not found", job_id)));
            }
        };

        worker.enrich(job, request.prompt_id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use applyflow_ai::GenerationError;
    use applyflow_core::{JobId, NewJob, PromptDraft};
    use applyflow_events::{EventLog, InMemoryEventLog};
    use chrono::Utc;

    use crate::pipeline::topology::{Role, Topology};
    use crate::retry::RetryPolicy;
    use crate::store::{
        FeatureStore, InMemoryFeatureStore, InMemoryJobStore, InMemoryPromptStore, JobRecordStore, PromptStore,
    };

    struct Recording {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for Recording {
        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().map_err(GenerationError::InvalidResponse)
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    struct Fixture {
        log: Arc<InMemoryEventLog>,
        jobs: Arc<InMemoryJobStore>,
        prompts: Arc<InMemoryPromptStore>,
        features: Arc<InMemoryFeatureStore>,
        generator: Arc<Recording>,
    }

    impl Fixture {
        async fn new(reply: Result<&str, &str>) -> Self {
            let log = Arc::new(InMemoryEventLog::new());
            Topology::new("JOBS", Default::default(), Duration::from_secs(60))
                .register(log.as_ref(), &Role::ALL, &RetryPolicy::fixed(1, Duration::ZERO))
                .await
                .unwrap();
            Self {
                log,
                jobs: Arc::new(InMemoryJobStore::new()),
                prompts: Arc::new(InMemoryPromptStore::new()),
                features: Arc::new(InMemoryFeatureStore::seeded()),
                generator: Arc::new(Recording {
                    reply: reply.map(String::from).map_err(String::from),
                    prompts: Mutex::new(Vec::new()),
                }),
            }
        }

        fn worker(&self, stage: Stage) -> Arc<EnrichmentWorker> {
            let ctx = PipelineContext::new(
                self.log.clone(),
                self.jobs.clone(),
                self.prompts.clone(),
                self.features.clone(),
            );
            EnrichmentWorker::new(stage, ctx, self.generator.clone())
        }

        async fn job(&self) -> JobRecord {
            self.jobs
                .insert_job(&NewJob::new("Engineer", "Acme", "http://x", "Build things"), None)
                .await
                .unwrap()
                .job
        }
    }

    fn delivery(subject: &str, payload: Vec<u8>) -> Delivery {
        Delivery {
            stream: "JOBS".to_string(),
            durable: "test".to_string(),
            subject: subject.to_string(),
            message_id: "1".to_string(),
            payload,
            delivery_count: 1,
            published_at: Utc::now(),
        }
    }

    fn request(stage: Stage, job: &JobRecord, prompt: Option<PromptId>) -> Delivery {
        let spec = EnrichmentStage::of(stage);
        let bytes = EventEnvelope::new(spec.request.event_type, GenerateRequest::new(job.id, prompt))
            .to_bytes()
            .unwrap();
        delivery(spec.request.subject, bytes)
    }

    #[tokio::test]
    async fn cv_trigger_writes_cv_and_announces() {
        let fx = Fixture::new(Ok("# Resume")).await;
        let job = fx.job().await;
        let bytes = EventEnvelope::new(event_type::JOB_CREATED, &job).to_bytes().unwrap();

        fx.worker(Stage::Cv)
            .trigger_handler()
            .handle(&delivery(JOBS_CREATED, bytes))
            .await
            .unwrap();

        let stored = fx.jobs.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.cv_generated);
        assert_eq!(stored.cv, "# Resume");

        let announced = fx.log.published_on(CV_GENERATED).unwrap();
        assert_eq!(announced.len(), 1);
        let snapshot = EventEnvelope::<JobRecord>::decode(&announced[0], event_type::CV_GENERATED).unwrap();
        assert!(snapshot.data().cv_generated);
    }

    #[tokio::test]
    async fn uses_fallback_prompt_without_default() {
        let fx = Fixture::new(Ok("letter")).await;
        let job = fx.job().await;
        fx.worker(Stage::CoverLetter)
            .request_handler()
            .handle(&request(Stage::CoverLetter, &job, None))
            .await
            .unwrap();

        let sent = fx.generator.prompts.lock().unwrap().clone();
        assert!(sent[0].starts_with(Stage::CoverLetter.fallback_prompt()));
        assert!(sent[0].contains("Company: Acme"));
        assert_eq!(fx.log.published_on(COVER_GENERATED).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn explicit_prompt_wins_over_default() {
        let fx = Fixture::new(Ok("cv")).await;
        fx.prompts
            .insert_prompt(&PromptDraft::new("default", "DEFAULT TEXT").default_for(Stage::Cv))
            .await
            .unwrap();
        let chosen = fx.prompts.insert_prompt(&PromptDraft::new("custom", "CUSTOM TEXT")).await.unwrap();
        let job = fx.job().await;

        fx.worker(Stage::Cv)
            .request_handler()
            .handle(&request(Stage::Cv, &job, Some(chosen.id)))
            .await
            .unwrap();

        let sent = fx.generator.prompts.lock().unwrap().clone();
        assert!(sent[0].starts_with("CUSTOM TEXT"));
    }

    #[tokio::test]
    async fn missing_prompt_leaves_cv_untouched() {
        let fx = Fixture::new(Ok("cv")).await;
        let job = fx.job().await;

        let err = fx
            .worker(Stage::Cv)
            .request_handler()
            .handle(&request(Stage::Cv, &job, Some(PromptId::new(3))))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Precondition(_)));
        assert!(fx.generator.prompts.lock().unwrap().is_empty());
        assert_eq!(fx.jobs.get_job(job.id).await.unwrap().unwrap().cv, "");
    }

    #[tokio::test]
    async fn score_without_cv_is_deferred() {
        let fx = Fixture::new(Ok("80")).await;
        let job = fx.job().await;

        let err = fx
            .worker(Stage::Score)
            .request_handler()
            .handle(&request(Stage::Score, &job, None))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Precondition(_)));
        assert_eq!(fx.jobs.get_job(job.id).await.unwrap().unwrap().score, None);
    }

    #[tokio::test]
    async fn score_parses_and_writes() {
        let fx = Fixture::new(Ok("Score: 85/100")).await;
        let job = fx.job().await;
        fx.jobs.update_job_cv(job.id, "my cv").await.unwrap();

        fx.worker(Stage::Score)
            .request_handler()
            .handle(&request(Stage::Score, &job, None))
            .await
            .unwrap();

        let stored = fx.jobs.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.score, Some(85.0));
        let sent = fx.generator.prompts.lock().unwrap().clone();
        assert!(sent[0].contains("CV: my cv"));
    }

    #[tokio::test]
    async fn unparseable_score_is_retryable() {
        let fx = Fixture::new(Ok("a great match")).await;
        let job = fx.job().await;
        fx.jobs.update_job_cv(job.id, "cv").await.unwrap();

        let err = fx
            .worker(Stage::Score)
            .request_handler()
            .handle(&request(Stage::Score, &job, None))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Collaborator(_)));
    }

    #[tokio::test]
    async fn generator_failure_is_retryable() {
        let fx = Fixture::new(Err("503")).await;
        let job = fx.job().await;
        let err = fx
            .worker(Stage::Cv)
            .request_handler()
            .handle(&request(Stage::Cv, &job, None))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Collaborator(_)));
        assert!(!fx.jobs.get_job(job.id).await.unwrap().unwrap().cv_generated);
    }

    #[tokio::test]
    async fn progress_follows_each_attempt() {
        let fx = Fixture::new(Ok("# Resume")).await;
        let job = fx.job().await;
        let worker = fx.worker(Stage::Cv);
        assert_eq!(worker.progress(job.id), StageProgress::Pending);

        worker.request_handler().handle(&request(Stage::Cv, &job, None)).await.unwrap();
        assert_eq!(worker.progress(job.id), StageProgress::Done);

        // regeneration of a finished stage is allowed
        worker.request_handler().handle(&request(Stage::Cv, &job, None)).await.unwrap();
        assert_eq!(worker.progress(job.id), StageProgress::Done);
        assert_eq!(fx.generator.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_generation_returns_to_pending() {
        let fx = Fixture::new(Err("503")).await;
        let job = fx.job().await;
        let worker = fx.worker(Stage::CoverLetter);

        let err = worker
            .request_handler()
            .handle(&request(Stage::CoverLetter, &job, None))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Collaborator(_)));
        assert_eq!(worker.progress(job.id), StageProgress::Pending);
    }

    #[tokio::test]
    async fn overlapping_generation_is_deferred() {
        let fx = Fixture::new(Ok("# Resume")).await;
        let job = fx.job().await;
        let worker = fx.worker(Stage::Cv);
        worker.transition(job.id, StageProgress::begin).unwrap();

        let err = worker
            .request_handler()
            .handle(&request(Stage::Cv, &job, None))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Precondition(_)));
        assert!(fx.generator.prompts.lock().unwrap().is_empty());
        assert_eq!(worker.progress(job.id), StageProgress::Generating);
    }

    #[tokio::test]
    async fn score_trigger_respects_flag() {
        let fx = Fixture::new(Ok("70")).await;
        let job = fx.job().await;
        fx.jobs.update_job_cv(job.id, "cv").await.unwrap();
        fx.features.set_feature(FeatureFlag::ScoreGeneration, false).await.unwrap();
        let snapshot = fx.jobs.get_job(job.id).await.unwrap().unwrap();
        let bytes = EventEnvelope::new(event_type::CV_GENERATED, &snapshot).to_bytes().unwrap();

        fx.worker(Stage::Score)
            .trigger_handler()
            .handle(&delivery(CV_GENERATED, bytes))
            .await
            .unwrap();

        assert!(fx.generator.prompts.lock().unwrap().is_empty());
        assert_eq!(fx.jobs.get_job(job.id).await.unwrap().unwrap().score, None);
    }

    #[tokio::test]
    async fn bad_payloads_are_malformed() {
        let fx = Fixture::new(Ok("cv")).await;
        let worker = fx.worker(Stage::Cv);

        let garbage = worker.request_handler().handle(&delivery(CV_GENERATE_REQUEST, b"{".to_vec())).await;
        assert!(matches!(garbage, Err(HandlerError::Malformed(_))));

        let wrong_type = EventEnvelope::new(event_type::COVER_GENERATION_REQUEST, GenerateRequest::new(JobId::new(1), None))
            .to_bytes()
            .unwrap();
        let mismatched = worker.request_handler().handle(&delivery(CV_GENERATE_REQUEST, wrong_type)).await;
        assert!(matches!(mismatched, Err(HandlerError::Malformed(_))));

        let bad_id = br#"{"type":"cv_generation_request","data":{"job_id":"seven"}}"#.to_vec();
        let unparsable = worker.request_handler().handle(&delivery(CV_GENERATE_REQUEST, bad_id)).await;
        assert!(matches!(unparsable, Err(HandlerError::Malformed(_))));
    }

    #[tokio::test]
    async fn publish_failure_after_write_still_succeeds() {
        let fx = Fixture::new(Ok("cv")).await;
        let job = fx.job().await;
        // A log with no streams rejects every publish.
        let ctx = PipelineContext::new(
            Arc::new(InMemoryEventLog::new()) as Arc<dyn EventLog>,
            fx.jobs.clone(),
            fx.prompts.clone(),
            fx.features.clone(),
        );
        let worker = EnrichmentWorker::new(Stage::Cv, ctx, fx.generator.clone());

        worker.request_handler().handle(&request(Stage::Cv, &job, None)).await.unwrap();
        assert!(fx.jobs.get_job(job.id).await.unwrap().unwrap().cv_generated);
    }
}
