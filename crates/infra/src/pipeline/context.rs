use std::sync::Arc;

use applyflow_events::EventLog;

use crate::store::{FeatureStore, JobRecordStore, PromptStore};

/// Process-scoped handles every pipeline role is built from.
///
/// Constructed once at startup and cloned into each handler.
#[derive(Clone)]
pub struct PipelineContext {
    pub log: Arc<dyn EventLog>,
    pub jobs: Arc<dyn JobRecordStore>,
    pub prompts: Arc<dyn PromptStore>,
    pub features: Arc<dyn FeatureStore>,
}

impl PipelineContext {
    pub fn new(
        log: Arc<dyn EventLog>,
        jobs: Arc<dyn JobRecordStore>,
        prompts: Arc<dyn PromptStore>,
        features: Arc<dyn FeatureStore>,
    ) -> Self {
        Self {
            log,
            jobs,
            prompts,
            features,
        }
    }

    /// One Postgres-backed store serving all three store roles.
    pub fn with_store<S>(log: Arc<dyn EventLog>, store: Arc<S>) -> Self
    where
        S: JobRecordStore + PromptStore + FeatureStore + 'static,
    {
        Self {
            log,
            jobs: store.clone(),
            prompts: store.clone(),
            features: store,
        }
    }
}
