//! Enrichment stages.
//!
//! The three generators (CV, cover letter, score) share one algorithm and
//! differ only in the data defined here: how the prompt is composed, how the
//! generated text becomes a field value, which field it lands in, and what the
//! stage requires of the record before it may run.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::job::JobRecord;

const CV_FALLBACK_PROMPT: &str = "Generate a professional CV for the following job:";

const COVER_FALLBACK_PROMPT: &str =
    "Generate a professional cover letter for the following job:";

const SCORE_RUBRIC: &str = "Score the following CV based on the provided job description. \
The CV will start below '**Resume**'. Only return a numerical score between 0 and 100, \
where 0 is a poor match and 100 is a perfect match. \
Do not include any explanations, notes, or additional text.";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Cv,
    CoverLetter,
    Score,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Cv, Stage::CoverLetter, Stage::Score];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Cv => "cv",
            Stage::CoverLetter => "cover",
            Stage::Score => "score",
        }
    }

    /// Prompt used when neither an explicit nor a default prompt exists.
    pub fn fallback_prompt(&self) -> &'static str {
        match self {
            Stage::Cv => CV_FALLBACK_PROMPT,
            Stage::CoverLetter => COVER_FALLBACK_PROMPT,
            Stage::Score => SCORE_RUBRIC,
        }
    }

    /// Checks the record must pass before generation starts.
    pub fn check_ready(&self, job: &JobRecord) -> DomainResult<()> {
        match self {
            Stage::Score if !job.has_cv() => Err(DomainError::precondition(format!(
                "job {} has no generated CV yet",
                job.id
            ))),
            _ => Ok(()),
        }
    }

    /// Prompt text followed by the structured job fields this stage needs.
    pub fn compose_prompt(&self, prompt_text: &str, job: &JobRecord) -> String {
        match self {
            Stage::Cv | Stage::CoverLetter => format!(
                "{}\n\nTitle: {}\nCompany: {}\nDescription: {}\n",
                prompt_text, job.title, job.company, job.description
            ),
            Stage::Score => format!(
                "{}\n\nJob Description: {}\nCV: {}\n",
                prompt_text, job.description, job.cv
            ),
        }
    }

    /// Turn raw generated text into this stage's field value.
    pub fn interpret(&self, generated: String) -> DomainResult<StageOutput> {
        match self {
            Stage::Cv => non_empty(self, generated).map(StageOutput::Cv),
            Stage::CoverLetter => non_empty(self, generated).map(StageOutput::CoverLetter),
            Stage::Score => parse_score(&generated).map(StageOutput::Score),
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

fn non_empty(stage: &Stage, text: String) -> DomainResult<String> {
    if text.trim().is_empty() {
        return Err(DomainError::validation(format!("{} generation returned no text", stage)));
    }
    Ok(text)
}

/// The value a stage writes into its own slice of the Job Record.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Cv(String),
    CoverLetter(String),
    Score(f64),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Cv(_) => Stage::Cv,
            StageOutput::CoverLetter(_) => Stage::CoverLetter,
            StageOutput::Score(_) => Stage::Score,
        }
    }

    pub fn apply_to(&self, job: &mut JobRecord) -> DomainResult<()> {
        match self {
            StageOutput::Cv(cv) => job.set_cv(cv.clone()),
            StageOutput::CoverLetter(text) => job.set_cover_letter(text.clone()),
            StageOutput::Score(score) => job.set_score(*score),
        }
    }
}

/// Extract the first number from generated score text.
///
/// Generators are asked for a bare number but frequently wrap it
/// (`"Score: 85/100"`, `"**72**"`).
pub fn parse_score(text: &str) -> DomainResult<f64> {
    let start = text
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| DomainError::validation(format!("no score in {:?}", truncate(text))))?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let score = digits
        .trim_end_matches('.')
        .parse::<f64>()
        .map_err(|e| DomainError::validation(format!("bad score {:?}: {}", digits, e)))?;
    if !(0.0..=100.0).contains(&score) {
        return Err(DomainError::validation(format!("score {} outside 0..=100", score)));
    }
    Ok(score)
}

fn truncate(text: &str) -> String {
    text.chars().take(40).collect()
}

/// Per-(job, stage) progress.
///
/// `Generating -> Pending` happens on any retryable failure; the message is
/// negatively acknowledged and the log redelivers it later. A finished stage
/// may be regenerated (`Done -> Generating`), but only one generation per
/// (job, stage) runs at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StageProgress {
    #[default]
    Pending,
    Generating,
    Done,
}

impl StageProgress {
    pub fn begin(self) -> DomainResult<Self> {
        match self {
            StageProgress::Pending | StageProgress::Done => Ok(StageProgress::Generating),
            StageProgress::Generating => Err(DomainError::precondition("generation already in progress")),
        }
    }

    pub fn complete(self) -> DomainResult<Self> {
        match self {
            StageProgress::Generating => Ok(StageProgress::Done),
            other => Err(DomainError::invariant(format!("cannot complete from {:?}", other))),
        }
    }

    pub fn retry(self) -> DomainResult<Self> {
        match self {
            StageProgress::Generating => Ok(StageProgress::Pending),
            other => Err(DomainError::invariant(format!("cannot retry from {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::JobId;
    use crate::job::NewJob;
    use chrono::Utc;
    use proptest::prelude::*;

    fn job() -> JobRecord {
        JobRecord::open(
            JobId::new(3),
            NewJob::new("Engineer", "Acme", "http://x", "Build things"),
            Utc::now(),
        )
    }

    #[test]
    fn cv_prompt_carries_descriptive_fields() {
        let prompt = Stage::Cv.compose_prompt("Write it", &job());
        assert_eq!(
            prompt,
            "Write it\n\nTitle: Engineer\nCompany: Acme\nDescription: Build things\n"
        );
    }

    #[test]
    fn score_prompt_carries_cv() {
        let mut job = job();
        job.set_cv("**Resume**\nJane").unwrap();
        let prompt = Stage::Score.compose_prompt(Stage::Score.fallback_prompt(), &job);
        assert!(prompt.starts_with(SCORE_RUBRIC));
        assert!(prompt.ends_with("Job Description: Build things\nCV: **Resume**\nJane\n"));
    }

    #[test]
    fn score_stage_waits_for_cv() {
        let mut job = job();
        assert!(matches!(Stage::Score.check_ready(&job), Err(DomainError::Precondition(_))));
        assert!(Stage::Cv.check_ready(&job).is_ok());

        job.set_cv("cv").unwrap();
        assert!(Stage::Score.check_ready(&job).is_ok());
    }

    #[test]
    fn interpret_routes_to_field() {
        let mut job = job();
        let out = Stage::Cv.interpret("the cv".to_string()).unwrap();
        assert_eq!(out.stage(), Stage::Cv);
        out.apply_to(&mut job).unwrap();
        assert!(job.cv_generated);

        let out = Stage::Score.interpret(" 87 ".to_string()).unwrap();
        out.apply_to(&mut job).unwrap();
        assert_eq!(job.score, Some(87.0));

        assert!(Stage::CoverLetter.interpret("\n".to_string()).is_err());
    }

    #[test]
    fn score_parsing_tolerates_decoration() {
        assert_eq!(parse_score("Score: 85/100").unwrap(), 85.0);
        assert_eq!(parse_score("**72.5**").unwrap(), 72.5);
        assert_eq!(parse_score("90.").unwrap(), 90.0);
        assert!(parse_score("excellent").is_err());
        assert!(parse_score("150").is_err());
    }

    #[test]
    fn progress_transitions() {
        let p = StageProgress::Pending.begin().unwrap();
        assert_eq!(p, StageProgress::Generating);
        assert_eq!(p.retry().unwrap(), StageProgress::Pending);
        assert_eq!(p.complete().unwrap(), StageProgress::Done);
        assert_eq!(StageProgress::Done.begin().unwrap(), StageProgress::Generating);
        assert!(matches!(p.begin(), Err(DomainError::Precondition(_))));
        assert!(StageProgress::Pending.complete().is_err());
        assert!(StageProgress::Done.retry().is_err());
    }

    proptest! {
        #[test]
        fn any_integer_score_survives_wrapping(n in 0u32..=100, prefix in "[A-Za-z: *]{0,12}") {
            let text = format!("{}{}/100", prefix, n);
            prop_assert_eq!(parse_score(&text).unwrap(), n as f64);
        }
    }
}
