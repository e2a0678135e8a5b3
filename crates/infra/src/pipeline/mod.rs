//! The enrichment pipeline: consumer harness, services, stages and wiring.

pub mod context;
pub mod enrichment;
pub mod harness;
pub mod job_service;
pub mod launch;
pub mod producer;
pub mod prompt_service;
pub mod topology;

pub use context::PipelineContext;
pub use enrichment::{EnrichmentStage, EnrichmentWorker, RequestHandler, Route, TriggerHandler};
pub use harness::{ConsumerBinding, ConsumerWorker, HandlerError, MessageHandler, WorkerHandle, WorkerStats};
pub use job_service::{JobCreationHandler, StatusUpdateHandler};
pub use launch::{LaunchError, Launcher};
pub use producer::{PipelineProducer, PublishError};
pub use prompt_service::{PromptCreationHandler, PromptUpdateHandler};
pub use topology::{ConsumerSpec, Role, Topology};
