//! Postgres-backed Job Record, prompt and feature stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (check violation) | `23514` | `Invalid` |
//! | Database (not-null violation) | `23502` | `Invalid` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed, network, decode | N/A | `Storage` |
//!
//! Stage writes are single `UPDATE` statements touching only their own
//! columns, so concurrent stages on one job never overwrite each other.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{info, instrument};

use applyflow_core::{
    Feature, FeatureFlag, JobId, JobRecord, JobStatus, NewJob, Prompt, PromptDraft, PromptId, Stage,
};

use super::{rules, FeatureStore, InsertOutcome, JobRecordStore, PromptStore, StoreError};

const JOB_COLUMNS: &str = "id, title, company, link, status, cv_generated, cv, description, score, \
                           applied_at, created_at, cover_letter";

const PROMPT_COLUMNS: &str =
    "id, name, prompt, cv_generation_default, score_generation_default, cover_generation_default";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Score write refused: tell a missing row apart from one without a CV.
    async fn explain_refused_score(&self, id: JobId) -> StoreError {
        match self.get_job(id).await {
            Ok(Some(_)) => StoreError::Precondition(format!("job {} has no generated CV yet", id)),
            Ok(None) => StoreError::JobNotFound(id),
            Err(err) => err,
        }
    }
}

/// Create the tables if they are missing and seed flags plus one default
/// prompt per stage.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            title TEXT NOT NULL,
            company TEXT NOT NULL,
            link TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'open'
                CHECK (status IN ('open', 'applied', 'closed')),
            cv_generated BOOLEAN NOT NULL DEFAULT FALSE,
            cv TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            score DOUBLE PRECISION CHECK (score IS NULL OR (score >= 0 AND score <= 100)),
            applied_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            cover_letter TEXT NOT NULL DEFAULT '',
            request_key TEXT UNIQUE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS prompts (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            prompt TEXT NOT NULL,
            cv_generation_default BOOLEAN NOT NULL DEFAULT FALSE,
            score_generation_default BOOLEAN NOT NULL DEFAULT FALSE,
            cover_generation_default BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS features (
            name TEXT PRIMARY KEY,
            value BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }

    for flag in FeatureFlag::ALL {
        sqlx::query("INSERT INTO features (name, value) VALUES ($1, TRUE) ON CONFLICT (name) DO NOTHING")
            .bind(flag.name())
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("seed_features", e))?;
    }

    let prompt_count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM prompts")
        .fetch_one(pool)
        .await
        .map_err(|e| map_sqlx_error("count_prompts", e))?
        .try_get("n")
        .map_err(|e| map_sqlx_error("count_prompts", e))?;

    if prompt_count == 0 {
        let store = PostgresStore::new(pool.clone());
        for stage in Stage::ALL {
            let draft = PromptDraft::new(format!("default {}", stage), stage.fallback_prompt()).default_for(stage);
            store.insert_prompt(&draft).await?;
        }
        info!("seeded default prompts");
    }

    Ok(())
}

#[async_trait]
impl JobRecordStore for PostgresStore {
    #[instrument(skip(self, job), fields(company = %job.company), err)]
    async fn insert_job(&self, job: &NewJob, request_key: Option<&str>) -> Result<InsertOutcome, StoreError> {
        rules::new_job(job)?;

        let sql = format!(
            "INSERT INTO jobs (title, company, link, description, request_key) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (request_key) DO NOTHING \
             RETURNING {}",
            JOB_COLUMNS
        );
        let inserted = sqlx::query(&sql)
            .bind(&job.title)
            .bind(&job.company)
            .bind(&job.link)
            .bind(&job.description)
            .bind(request_key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome {
                job: job_from_row(&row, "insert_job")?,
                created: true,
            });
        }

        // Conflict: the key was used by an earlier delivery of the same request.
        let sql = format!("SELECT {} FROM jobs WHERE request_key = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(request_key)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job_existing", e))?;
        Ok(InsertOutcome {
            job: job_from_row(&row, "insert_job_existing")?,
            created: false,
        })
    }

    #[instrument(skip(self), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| job_from_row(&r, "get_job")).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY id DESC",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(|r| job_from_row(r, "list_jobs")).collect()
    }

    #[instrument(skip(self, cv), fields(cv_len = cv.len()), err)]
    async fn update_job_cv(&self, id: JobId, cv: &str) -> Result<(), StoreError> {
        rules::generated_text("CV", cv)?;
        let result = sqlx::query("UPDATE jobs SET cv = $2, cv_generated = TRUE WHERE id = $1")
            .bind(id.get())
            .bind(cv)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job_cv", e))?;
        expect_one_row(result.rows_affected(), id)
    }

    #[instrument(skip(self, cover_letter), fields(cover_len = cover_letter.len()), err)]
    async fn update_job_cover_letter(&self, id: JobId, cover_letter: &str) -> Result<(), StoreError> {
        rules::generated_text("cover letter", cover_letter)?;
        let result = sqlx::query("UPDATE jobs SET cover_letter = $2 WHERE id = $1")
            .bind(id.get())
            .bind(cover_letter)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job_cover_letter", e))?;
        expect_one_row(result.rows_affected(), id)
    }

    #[instrument(skip(self), err)]
    async fn update_job_score(&self, id: JobId, score: f64) -> Result<(), StoreError> {
        rules::score(score)?;
        let result = sqlx::query("UPDATE jobs SET score = $2 WHERE id = $1 AND cv_generated")
            .bind(id.get())
            .bind(score)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job_score", e))?;
        if result.rows_affected() == 0 {
            return Err(self.explain_refused_score(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn update_job_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                applied_at = CASE
                    WHEN $2 = 'applied' AND status <> 'applied' THEN NOW()
                    ELSE applied_at
                END,
                status = $2
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job_status", e))?;
        expect_one_row(result.rows_affected(), id)
    }
}

#[async_trait]
impl PromptStore for PostgresStore {
    #[instrument(skip(self), err)]
    async fn get_prompt(&self, id: PromptId) -> Result<Option<Prompt>, StoreError> {
        let sql = format!("SELECT {} FROM prompts WHERE id = $1", PROMPT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_prompt", e))?;
        row.map(|r| PromptRow::from_row(&r).map(Prompt::from).map_err(|e| map_sqlx_error("get_prompt", e)))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn default_prompt(&self, stage: Stage) -> Result<Option<Prompt>, StoreError> {
        let sql = format!(
            "SELECT {} FROM prompts WHERE {} ORDER BY id ASC LIMIT 1",
            PROMPT_COLUMNS,
            default_column(stage)
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("default_prompt", e))?;
        row.map(|r| PromptRow::from_row(&r).map(Prompt::from).map_err(|e| map_sqlx_error("default_prompt", e)))
            .transpose()
    }

    #[instrument(skip(self, draft), fields(name = %draft.name), err)]
    async fn insert_prompt(&self, draft: &PromptDraft) -> Result<Prompt, StoreError> {
        draft.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("insert_prompt", e))?;
        clear_defaults(&mut tx, draft, None).await?;

        let sql = format!(
            "INSERT INTO prompts (name, prompt, cv_generation_default, score_generation_default, \
             cover_generation_default) VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            PROMPT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&draft.name)
            .bind(&draft.prompt)
            .bind(draft.cv_generation_default)
            .bind(draft.score_generation_default)
            .bind(draft.cover_generation_default)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_prompt", e))?;
        let prompt = PromptRow::from_row(&row).map_err(|e| map_sqlx_error("insert_prompt", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("insert_prompt", e))?;
        Ok(prompt.into())
    }

    #[instrument(skip(self, draft), fields(name = %draft.name), err)]
    async fn update_prompt(&self, id: PromptId, draft: &PromptDraft) -> Result<Prompt, StoreError> {
        draft.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("update_prompt", e))?;
        clear_defaults(&mut tx, draft, Some(id)).await?;

        let sql = format!(
            "UPDATE prompts SET name = $2, prompt = $3, cv_generation_default = $4, \
             score_generation_default = $5, cover_generation_default = $6 WHERE id = $1 RETURNING {}",
            PROMPT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(&draft.name)
            .bind(&draft.prompt)
            .bind(draft.cv_generation_default)
            .bind(draft.score_generation_default)
            .bind(draft.cover_generation_default)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_prompt", e))?
            .ok_or(StoreError::PromptNotFound(id))?;
        let prompt = PromptRow::from_row(&row).map_err(|e| map_sqlx_error("update_prompt", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("update_prompt", e))?;
        Ok(prompt.into())
    }
}

#[async_trait]
impl FeatureStore for PostgresStore {
    #[instrument(skip(self), fields(flag = flag.name()), err)]
    async fn feature_value(&self, flag: FeatureFlag) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT value FROM features WHERE name = $1")
            .bind(flag.name())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("feature_value", e))?;
        match row {
            Some(row) => row.try_get("value").map_err(|e| map_sqlx_error("feature_value", e)),
            None => Ok(false),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_features(&self) -> Result<Vec<Feature>, StoreError> {
        let rows = sqlx::query("SELECT name, value FROM features ORDER BY name")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_features", e))?;
        rows.iter()
            .map(|row| {
                Ok(Feature {
                    name: row.try_get("name")?,
                    value: row.try_get("value")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("list_features", e))
    }

    #[instrument(skip(self), fields(flag = flag.name()), err)]
    async fn set_feature(&self, flag: FeatureFlag, value: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO features (name, value) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(flag.name())
        .bind(value)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_feature", e))?;
        Ok(())
    }
}

fn default_column(stage: Stage) -> &'static str {
    match stage {
        Stage::Cv => "cv_generation_default",
        Stage::CoverLetter => "cover_generation_default",
        Stage::Score => "score_generation_default",
    }
}

/// At most one default prompt per stage.
async fn clear_defaults(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    draft: &PromptDraft,
    except: Option<PromptId>,
) -> Result<(), StoreError> {
    for stage in draft.default_stages() {
        let sql = format!(
            "UPDATE prompts SET {col} = FALSE WHERE {col} AND ($1::BIGINT IS NULL OR id <> $1)",
            col = default_column(stage)
        );
        sqlx::query(&sql)
            .bind(except.map(|id| id.get()))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("clear_defaults", e))?;
    }
    Ok(())
}

fn expect_one_row(rows_affected: u64, id: JobId) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(StoreError::JobNotFound(id));
    }
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") | Some("23502") => StoreError::Invalid(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {}", operation)),
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn job_from_row(row: &PgRow, operation: &str) -> Result<JobRecord, StoreError> {
    let row = JobRow::from_row(row).map_err(|e| map_sqlx_error(operation, e))?;
    JobRecord::try_from(row)
}

struct JobRow {
    id: i64,
    title: String,
    company: String,
    link: String,
    status: String,
    cv_generated: bool,
    cv: String,
    description: String,
    score: Option<f64>,
    applied_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    cover_letter: String,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            company: row.try_get("company")?,
            link: row.try_get("link")?,
            status: row.try_get("status")?,
            cv_generated: row.try_get("cv_generated")?,
            cv: row.try_get("cv")?,
            description: row.try_get("description")?,
            score: row.try_get("score")?,
            applied_at: row.try_get("applied_at")?,
            created_at: row.try_get("created_at")?,
            cover_letter: row.try_get("cover_letter")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status)
            .map_err(|e| StoreError::Invalid(format!("job {} has status {:?}: {}", row.id, row.status, e)))?;
        Ok(JobRecord {
            id: JobId::new(row.id),
            title: row.title,
            company: row.company,
            link: row.link,
            status,
            cv_generated: row.cv_generated,
            cv: row.cv,
            description: row.description,
            score: row.score,
            applied_at: row.applied_at,
            created_at: row.created_at,
            cover_letter: row.cover_letter,
        })
    }
}

struct PromptRow {
    id: i64,
    name: String,
    prompt: String,
    cv_generation_default: bool,
    score_generation_default: bool,
    cover_generation_default: bool,
}

impl<'r> FromRow<'r, PgRow> for PromptRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PromptRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            prompt: row.try_get("prompt")?,
            cv_generation_default: row.try_get("cv_generation_default")?,
            score_generation_default: row.try_get("score_generation_default")?,
            cover_generation_default: row.try_get("cover_generation_default")?,
        })
    }
}

impl From<PromptRow> for Prompt {
    fn from(row: PromptRow) -> Self {
        Prompt {
            id: PromptId::new(row.id),
            name: row.name,
            prompt: row.prompt,
            cv_generation_default: row.cv_generation_default,
            score_generation_default: row.score_generation_default,
            cover_generation_default: row.cover_generation_default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_columns_match_stage() {
        assert_eq!(default_column(Stage::Cv), "cv_generation_default");
        assert_eq!(default_column(Stage::CoverLetter), "cover_generation_default");
        assert_eq!(default_column(Stage::Score), "score_generation_default");
    }

    #[test]
    fn zero_rows_is_not_found() {
        assert!(matches!(expect_one_row(0, JobId::new(4)), Err(StoreError::JobNotFound(_))));
        assert!(expect_one_row(1, JobId::new(4)).is_ok());
    }

    #[test]
    fn row_with_unknown_status_is_invalid() {
        let row = JobRow {
            id: 1,
            title: "t".into(),
            company: "c".into(),
            link: String::new(),
            status: "archived".into(),
            cv_generated: false,
            cv: String::new(),
            description: String::new(),
            score: None,
            applied_at: None,
            created_at: Utc::now(),
            cover_letter: String::new(),
        };
        assert!(matches!(JobRecord::try_from(row), Err(StoreError::Invalid(_))));
    }
}
