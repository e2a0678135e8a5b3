//! `applyflow-core`: job-application domain primitives.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! the Job Record and its transitions, prompts, feature flags and the
//! enrichment stage definitions.

pub mod error;
pub mod feature;
pub mod id;
pub mod job;
pub mod prompt;
pub mod stage;

pub use error::{DomainError, DomainResult};
pub use feature::{Feature, FeatureFlag};
pub use id::{JobId, PromptId};
pub use job::{JobRecord, JobStatus, NewJob};
pub use prompt::{Prompt, PromptDraft};
pub use stage::{parse_score, Stage, StageOutput, StageProgress};
