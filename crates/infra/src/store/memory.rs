//! In-memory stores for tests and local runs.
//!
//! Each targeted update runs under one write lock, the in-process analogue
//! of a single UPDATE statement.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use applyflow_core::{
    DomainError, Feature, FeatureFlag, JobId, JobRecord, JobStatus, NewJob, Prompt, PromptDraft, PromptId,
    Stage,
};

use super::{rules, FeatureStore, InsertOutcome, JobRecordStore, PromptStore, StoreError};

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read().map_err(|_| poisoned())
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write().map_err(|_| poisoned())
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Precondition(msg) => StoreError::Precondition(msg),
            other => StoreError::Invalid(other.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct JobTable {
    rows: BTreeMap<JobId, JobRecord>,
    last_id: i64,
    request_keys: HashMap<String, JobId>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: RwLock<JobTable>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: JobId, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), DomainError>,
    {
        let mut table = write(&self.table)?;
        let row = table.rows.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        // Apply to a copy so a rejected write leaves the row untouched.
        let mut next = row.clone();
        f(&mut next)?;
        *row = next;
        Ok(())
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobStore {
    async fn insert_job(&self, job: &NewJob, request_key: Option<&str>) -> Result<InsertOutcome, StoreError> {
        rules::new_job(job)?;
        let mut table = write(&self.table)?;
        if let Some(key) = request_key {
            if let Some(existing) = table.request_keys.get(key).and_then(|id| table.rows.get(id)) {
                return Ok(InsertOutcome {
                    job: existing.clone(),
                    created: false,
                });
            }
        }
        table.last_id += 1;
        let id = JobId::new(table.last_id);
        let record = JobRecord::open(id, job.clone(), Utc::now());
        table.rows.insert(id, record.clone());
        if let Some(key) = request_key {
            table.request_keys.insert(key.to_string(), id);
        }
        Ok(InsertOutcome {
            job: record,
            created: true,
        })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(read(&self.table)?.rows.get(&id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError> {
        let table = read(&self.table)?;
        Ok(table
            .rows
            .values()
            .rev()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect())
    }

    async fn update_job_cv(&self, id: JobId, cv: &str) -> Result<(), StoreError> {
        rules::generated_text("CV", cv)?;
        self.update(id, |job| job.set_cv(cv))
    }

    async fn update_job_cover_letter(&self, id: JobId, cover_letter: &str) -> Result<(), StoreError> {
        rules::generated_text("cover letter", cover_letter)?;
        self.update(id, |job| job.set_cover_letter(cover_letter))
    }

    async fn update_job_score(&self, id: JobId, score: f64) -> Result<(), StoreError> {
        rules::score(score)?;
        self.update(id, |job| job.set_score(score))
    }

    async fn update_job_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.change_status(status, Utc::now());
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct PromptTable {
    rows: BTreeMap<PromptId, Prompt>,
    last_id: i64,
}

impl PromptTable {
    fn clear_defaults(&mut self, stages: &[Stage], except: Option<PromptId>) {
        for prompt in self.rows.values_mut().filter(|p| Some(p.id) != except) {
            for stage in stages {
                match stage {
                    Stage::Cv => prompt.cv_generation_default = false,
                    Stage::CoverLetter => prompt.cover_generation_default = false,
                    Stage::Score => prompt.score_generation_default = false,
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPromptStore {
    table: RwLock<PromptTable>,
}

impl InMemoryPromptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PromptStore for InMemoryPromptStore {
    async fn get_prompt(&self, id: PromptId) -> Result<Option<Prompt>, StoreError> {
        Ok(read(&self.table)?.rows.get(&id).cloned())
    }

    async fn default_prompt(&self, stage: Stage) -> Result<Option<Prompt>, StoreError> {
        Ok(read(&self.table)?
            .rows
            .values()
            .find(|p| p.is_default_for(stage))
            .cloned())
    }

    async fn insert_prompt(&self, draft: &PromptDraft) -> Result<Prompt, StoreError> {
        draft.validate()?;
        let mut table = write(&self.table)?;
        table.last_id += 1;
        let id = PromptId::new(table.last_id);
        table.clear_defaults(&draft.default_stages(), None);
        let prompt = draft.clone().with_id(id);
        table.rows.insert(id, prompt.clone());
        Ok(prompt)
    }

    async fn update_prompt(&self, id: PromptId, draft: &PromptDraft) -> Result<Prompt, StoreError> {
        draft.validate()?;
        let mut table = write(&self.table)?;
        if !table.rows.contains_key(&id) {
            return Err(StoreError::PromptNotFound(id));
        }
        table.clear_defaults(&draft.default_stages(), Some(id));
        let prompt = draft.clone().with_id(id);
        table.rows.insert(id, prompt.clone());
        Ok(prompt)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFeatureStore {
    flags: RwLock<BTreeMap<String, bool>>,
}

impl InMemoryFeatureStore {
    /// No rows: every flag reads as disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// The flags a fresh database is seeded with.
    pub fn seeded() -> Self {
        let flags = FeatureFlag::ALL
            .into_iter()
            .map(|flag| (flag.name().to_string(), true))
            .collect();
        Self {
            flags: RwLock::new(flags),
        }
    }
}

#[async_trait]
impl FeatureStore for InMemoryFeatureStore {
    async fn feature_value(&self, flag: FeatureFlag) -> Result<bool, StoreError> {
        Ok(read(&self.flags)?.get(flag.name()).copied().unwrap_or(false))
    }

    async fn list_features(&self) -> Result<Vec<Feature>, StoreError> {
        Ok(read(&self.flags)?
            .iter()
            .map(|(name, value)| Feature {
                name: name.clone(),
                value: *value,
            })
            .collect())
    }

    async fn set_feature(&self, flag: FeatureFlag, value: bool) -> Result<(), StoreError> {
        write(&self.flags)?.insert(flag.name().to_string(), value);
        Ok(())
    }
}
