//! Feature flags gating whether a stage's trigger event is emitted.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureFlag {
    /// Job Service emits `jobs.created` after inserting a job.
    #[serde(rename = "cvGeneration")]
    CvGeneration,
    /// Score worker reacts to `jobs.cvgenerated`.
    #[serde(rename = "scoreGeneration")]
    ScoreGeneration,
}

impl FeatureFlag {
    pub const ALL: [FeatureFlag; 2] = [FeatureFlag::CvGeneration, FeatureFlag::ScoreGeneration];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureFlag::CvGeneration => "cvGeneration",
            FeatureFlag::ScoreGeneration => "scoreGeneration",
        }
    }
}

impl core::fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureFlag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureFlag::ALL
            .into_iter()
            .find(|flag| flag.name() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown feature flag {:?}", s)))
    }
}

/// A stored flag row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: bool,
}
