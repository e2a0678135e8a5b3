//! Job Record, prompt and feature-flag stores.
//!
//! Every write is a narrow, single-statement update keyed by id, so stages
//! writing disjoint fields of the same job never clobber each other.

use async_trait::async_trait;

use applyflow_core::{
    Feature, FeatureFlag, JobId, JobRecord, JobStatus, NewJob, Prompt, PromptDraft, PromptId, Stage,
    StageOutput,
};

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryFeatureStore, InMemoryJobStore, InMemoryPromptStore};
pub use postgres::{ensure_schema, PostgresStore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("prompt not found: {0}")]
    PromptNotFound(PromptId),

    /// The row exists but is not in a state that accepts this write yet.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of inserting a job under an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub job: JobRecord,
    /// False when the key was already used and the existing row is returned.
    pub created: bool,
}

#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert an open, unenriched job. A repeated `request_key` returns the
    /// row created by the first call instead of inserting again.
    async fn insert_job(&self, job: &NewJob, request_key: Option<&str>) -> Result<InsertOutcome, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// All jobs, newest first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError>;

    /// Set `cv` and `cvGenerated = true`.
    async fn update_job_cv(&self, id: JobId, cv: &str) -> Result<(), StoreError>;

    async fn update_job_cover_letter(&self, id: JobId, cover_letter: &str) -> Result<(), StoreError>;

    /// Set `score`; refused while the job has no generated CV.
    async fn update_job_score(&self, id: JobId, score: f64) -> Result<(), StoreError>;

    /// Set `status`; `applied_at` is stamped only when entering `applied`.
    async fn update_job_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError>;
}

/// Field rules every [`JobRecordStore`] checks before touching a row, in
/// this order, so the in-memory and database stores refuse the same writes.
pub(crate) mod rules {
    use applyflow_core::NewJob;

    use super::StoreError;

    pub fn new_job(job: &NewJob) -> Result<(), StoreError> {
        job.validate().map_err(|e| StoreError::Invalid(e.to_string()))
    }

    pub fn generated_text(field: &str, text: &str) -> Result<(), StoreError> {
        if text.trim().is_empty() {
            return Err(StoreError::Invalid(format!("generated {} is empty", field)));
        }
        Ok(())
    }

    pub fn score(score: f64) -> Result<(), StoreError> {
        if !(0.0..=100.0).contains(&score) {
            return Err(StoreError::Invalid(format!("score {} outside 0..=100", score)));
        }
        Ok(())
    }
}

/// Write one stage's output through the matching targeted update.
pub async fn write_stage_output(
    store: &dyn JobRecordStore,
    id: JobId,
    output: &StageOutput,
) -> Result<(), StoreError> {
    match output {
        StageOutput::Cv(cv) => store.update_job_cv(id, cv).await,
        StageOutput::CoverLetter(text) => store.update_job_cover_letter(id, text).await,
        StageOutput::Score(score) => store.update_job_score(id, *score).await,
    }
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn get_prompt(&self, id: PromptId) -> Result<Option<Prompt>, StoreError>;

    /// The prompt flagged as default for `stage`, if any.
    async fn default_prompt(&self, stage: Stage) -> Result<Option<Prompt>, StoreError>;

    /// Insert a prompt. Default flags it claims are cleared on other prompts.
    async fn insert_prompt(&self, draft: &PromptDraft) -> Result<Prompt, StoreError>;

    async fn update_prompt(&self, id: PromptId, draft: &PromptDraft) -> Result<Prompt, StoreError>;
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Flag value; a missing row reads as disabled.
    async fn feature_value(&self, flag: FeatureFlag) -> Result<bool, StoreError>;

    async fn list_features(&self) -> Result<Vec<Feature>, StoreError>;

    async fn set_feature(&self, flag: FeatureFlag, value: bool) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Write rules shared by every job store implementation.
    async fn enforces_write_rules(store: &dyn JobRecordStore) {
        let blank_title = store.insert_job(&NewJob::new(" ", "Acme", "", ""), Some("k1")).await;
        assert!(matches!(blank_title, Err(StoreError::Invalid(_))));
        let blank_company = store.insert_job(&NewJob::new("Engineer", "", "", ""), None).await;
        assert!(matches!(blank_company, Err(StoreError::Invalid(_))));
        assert!(store.list_jobs(None).await.unwrap().is_empty());

        let job = store
            .insert_job(&NewJob::new("Engineer", "Acme", "http://x", "Build things"), Some("k1"))
            .await
            .unwrap()
            .job;

        for empty in ["", "  \n"] {
            assert!(matches!(store.update_job_cv(job.id, empty).await, Err(StoreError::Invalid(_))));
            assert!(matches!(
                store.update_job_cover_letter(job.id, empty).await,
                Err(StoreError::Invalid(_))
            ));
        }
        assert!(matches!(
            store.update_job_score(job.id, 40.0).await,
            Err(StoreError::Precondition(_))
        ));

        store.update_job_cv(job.id, "cv").await.unwrap();
        assert!(matches!(store.update_job_score(job.id, 101.0).await, Err(StoreError::Invalid(_))));
        store.update_job_cover_letter(job.id, "letter").await.unwrap();
        store.update_job_score(job.id, 40.0).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.cover_letter, "letter");
        assert_eq!(stored.score, Some(40.0));

        let missing = JobId::new(job.id.get() + 100);
        assert!(matches!(
            store.update_job_cover_letter(missing, "letter").await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn in_memory_store_enforces_write_rules() {
        enforces_write_rules(&InMemoryJobStore::new()).await;
    }
}
