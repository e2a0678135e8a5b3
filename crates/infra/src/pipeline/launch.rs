//! Wiring from a [`Role`] to its running consumer workers.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use applyflow_ai::Generator;
use applyflow_core::Stage;

use crate::pdf::PdfSink;
use crate::retry::RetryPolicy;

use super::context::PipelineContext;
use super::enrichment::EnrichmentWorker;
use super::harness::{ConsumerBinding, ConsumerWorker, MessageHandler, WorkerHandle};
use super::job_service::{JobCreationHandler, StatusUpdateHandler};
use super::prompt_service::{PromptCreationHandler, PromptUpdateHandler};
use super::topology::{
    Role, COVER_PDF, CV_PDF, JOB_SERVICE, JOB_STATUS_UPDATE, PROMPT_CREATE, PROMPT_UPDATE,
};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("role {0} needs a generator")]
    MissingGenerator(&'static str),

    #[error("role {0} needs a pdf output directory")]
    MissingOutputDir(&'static str),
}

/// Builds the handlers for each role and spawns one worker per durable.
#[derive(Clone)]
pub struct Launcher {
    ctx: PipelineContext,
    stream: String,
    policy: RetryPolicy,
    generator: Option<Arc<dyn Generator>>,
    pdf_output_dir: Option<PathBuf>,
}

impl Launcher {
    pub fn new(ctx: PipelineContext, stream: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            ctx,
            stream: stream.into(),
            policy,
            generator: None,
            pdf_output_dir: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_pdf_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pdf_output_dir = Some(dir.into());
        self
    }

    pub fn spawn(&self, role: Role) -> Result<Vec<WorkerHandle>, LaunchError> {
        let handles = match role {
            Role::JobService => vec![
                self.worker(JOB_SERVICE, JobCreationHandler::new(self.ctx.clone())),
                self.worker(JOB_STATUS_UPDATE, StatusUpdateHandler::new(self.ctx.clone())),
            ],
            Role::PromptService => vec![
                self.worker(PROMPT_CREATE, PromptCreationHandler::new(self.ctx.clone())),
                self.worker(PROMPT_UPDATE, PromptUpdateHandler::new(self.ctx.clone())),
            ],
            Role::Enrichment(stage) => self.spawn_stage(role, stage)?,
            Role::PdfSink => {
                let dir = self
                    .pdf_output_dir
                    .clone()
                    .ok_or(LaunchError::MissingOutputDir(role.name()))?;
                let sink = PdfSink::new(dir);
                vec![
                    self.worker(CV_PDF, sink.cv_handler()),
                    self.worker(COVER_PDF, sink.cover_letter_handler()),
                ]
            }
        };
        info!(role = role.name(), workers = handles.len(), "role started");
        Ok(handles)
    }

    pub fn spawn_all(&self, roles: &[Role]) -> Result<Vec<WorkerHandle>, LaunchError> {
        let mut handles = Vec::new();
        for role in roles {
            handles.extend(self.spawn(*role)?);
        }
        Ok(handles)
    }

    fn spawn_stage(&self, role: Role, stage: Stage) -> Result<Vec<WorkerHandle>, LaunchError> {
        let generator = self
            .generator
            .clone()
            .ok_or(LaunchError::MissingGenerator(role.name()))?;
        let worker = EnrichmentWorker::new(stage, self.ctx.clone(), generator);
        let spec = *worker.spec();
        Ok(vec![
            self.worker(spec.trigger_durable, worker.trigger_handler()),
            self.worker(spec.request_durable, worker.request_handler()),
        ])
    }

    fn worker<H: MessageHandler + 'static>(&self, durable: &str, handler: H) -> WorkerHandle {
        ConsumerWorker::spawn(
            durable,
            self.ctx.log.clone(),
            ConsumerBinding::new(&self.stream, durable),
            handler,
            self.policy.clone(),
        )
    }
}
