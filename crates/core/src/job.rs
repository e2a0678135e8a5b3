//! The Job Record: canonical mutable state for one tracked job application.
//!
//! The store applies every change as a narrow targeted update. The methods
//! here are the in-memory mirror of those updates; workers use them to build
//! the follow-on snapshot after a successful write, and the in-memory store
//! uses them directly.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Lifecycle status, changed only by explicit status-update requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Open,
    Applied,
    Closed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Open => "open",
            JobStatus::Applied => "applied",
            JobStatus::Closed => "closed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(JobStatus::Open),
            "applied" => Ok(JobStatus::Applied),
            "closed" => Ok(JobStatus::Closed),
            other => Err(DomainError::validation(format!("unknown job status {:?}", other))),
        }
    }
}

/// Descriptive attributes of a job, as supplied by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub description: String,
}

impl NewJob {
    pub fn new(
        title: impl Into<String>,
        company: impl Into<String>,
        link: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            company: company.into(),
            link: link.into(),
            description: description.into(),
        }
    }

    /// A creation request needs at least a title and a company.
    pub fn validate(&self) -> DomainResult<()> {
        if self.title.trim().is_empty() {
            return Err(DomainError::validation("job title is empty"));
        }
        if self.company.trim().is_empty() {
            return Err(DomainError::validation("job company is empty"));
        }
        Ok(())
    }
}

/// Full Job Record snapshot, as stored and as carried by `*.created` /
/// `*.generated` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub link: String,
    pub status: JobStatus,
    #[serde(rename = "cvGenerated", default)]
    pub cv_generated: bool,
    #[serde(default)]
    pub cv: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cover_letter: String,
}

impl JobRecord {
    /// A freshly inserted record: open, no enrichment yet.
    pub fn open(id: JobId, job: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: job.title,
            company: job.company,
            link: job.link,
            status: JobStatus::Open,
            cv_generated: false,
            cv: String::new(),
            description: job.description,
            score: None,
            applied_at: None,
            created_at,
            cover_letter: String::new(),
        }
    }

    /// True when a CV exists and may be scored or rendered.
    pub fn has_cv(&self) -> bool {
        self.cv_generated && !self.cv.is_empty()
    }

    /// `cvGenerated` must agree with whether `cv` has content.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.cv_generated != !self.cv.is_empty() {
            return Err(DomainError::invariant(format!(
                "job {}: cvGenerated={} but cv is {}",
                self.id,
                self.cv_generated,
                if self.cv.is_empty() { "empty" } else { "present" }
            )));
        }
        if let Some(score) = self.score {
            if !self.cv_generated {
                return Err(DomainError::invariant(format!(
                    "job {}: score {} recorded without a CV",
                    self.id, score
                )));
            }
        }
        Ok(())
    }

    /// Set the CV body; `cvGenerated` follows.
    pub fn set_cv(&mut self, cv: impl Into<String>) -> DomainResult<()> {
        let cv = cv.into();
        if cv.trim().is_empty() {
            return Err(DomainError::invariant(format!("job {}: generated CV is empty", self.id)));
        }
        self.cv = cv;
        self.cv_generated = true;
        Ok(())
    }

    pub fn set_cover_letter(&mut self, text: impl Into<String>) -> DomainResult<()> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(DomainError::invariant(format!(
                "job {}: generated cover letter is empty",
                self.id
            )));
        }
        self.cover_letter = text;
        Ok(())
    }

    /// Record a match score. Only valid once the CV exists.
    pub fn set_score(&mut self, score: f64) -> DomainResult<()> {
        if !self.has_cv() {
            return Err(DomainError::precondition(format!(
                "job {}: cannot score before the CV is generated",
                self.id
            )));
        }
        if !(0.0..=100.0).contains(&score) {
            return Err(DomainError::validation(format!("score {} outside 0..=100", score)));
        }
        self.score = Some(score);
        Ok(())
    }

    /// Change status. `applied_at` is stamped only when entering `applied`.
    pub fn change_status(&mut self, status: JobStatus, now: DateTime<Utc>) {
        if status == JobStatus::Applied && self.status != JobStatus::Applied {
            self.applied_at = Some(now);
        }
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> JobRecord {
        let created = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        JobRecord::open(
            JobId::new(1),
            NewJob::new("Engineer", "Acme", "http://x", "Build things"),
            created,
        )
    }

    #[test]
    fn new_record_starts_unenriched() {
        let job = record();
        assert_eq!(job.status, JobStatus::Open);
        assert!(!job.cv_generated);
        assert!(job.cv.is_empty());
        assert!(job.cover_letter.is_empty());
        assert_eq!(job.score, None);
        assert_eq!(job.applied_at, None);
        job.check_invariants().unwrap();
    }

    #[test]
    fn set_cv_flips_flag() {
        let mut job = record();
        job.set_cv("**Resume**\nJane").unwrap();
        assert!(job.has_cv());
        job.check_invariants().unwrap();
    }

    #[test]
    fn empty_cv_is_rejected() {
        let mut job = record();
        let err = job.set_cv("   ").unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert!(!job.cv_generated);
    }

    #[test]
    fn score_requires_cv() {
        let mut job = record();
        let err = job.set_score(80.0).unwrap_err();
        assert!(matches!(err, DomainError::Precondition(_)));

        job.set_cv("cv").unwrap();
        job.set_score(80.0).unwrap();
        assert_eq!(job.score, Some(80.0));
        assert!(job.set_score(101.0).is_err());
    }

    #[test]
    fn applied_at_is_set_only_on_transition() {
        let mut job = record();
        let first = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

        job.change_status(JobStatus::Applied, first);
        assert_eq!(job.applied_at, Some(first));

        job.change_status(JobStatus::Applied, later);
        assert_eq!(job.applied_at, Some(first));

        job.change_status(JobStatus::Closed, later);
        assert_eq!(job.status, JobStatus::Closed);
        assert_eq!(job.applied_at, Some(first));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Applied".parse::<JobStatus>().unwrap(), JobStatus::Applied);
        assert!("archived".parse::<JobStatus>().is_err());
    }

    #[test]
    fn snapshot_uses_wire_field_names() {
        let mut job = record();
        job.set_cv("cv text").unwrap();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["cvGenerated"], true);
        assert_eq!(value["cover_letter"], "");
        assert_eq!(value["status"], "open");
        assert!(value["score"].is_null());

        let back: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn validation_requires_title_and_company() {
        assert!(NewJob::new("", "Acme", "", "").validate().is_err());
        assert!(NewJob::new("Engineer", " ", "", "").validate().is_err());
        assert!(NewJob::new("Engineer", "Acme", "", "").validate().is_ok());
    }
}
