//! Stored prompts and their per-stage default flags.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::PromptId;
use crate::stage::Stage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: PromptId,
    pub name: String,
    pub prompt: String,
    #[serde(rename = "cvGenerationDefault", default)]
    pub cv_generation_default: bool,
    #[serde(rename = "scoreGenerationDefault", default)]
    pub score_generation_default: bool,
    #[serde(rename = "coverGenerationDefault", default)]
    pub cover_generation_default: bool,
}

impl Prompt {
    pub fn is_default_for(&self, stage: Stage) -> bool {
        match stage {
            Stage::Cv => self.cv_generation_default,
            Stage::CoverLetter => self.cover_generation_default,
            Stage::Score => self.score_generation_default,
        }
    }
}

/// Prompt attributes without an id (creation, or the body of an update).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDraft {
    pub name: String,
    pub prompt: String,
    #[serde(rename = "cvGenerationDefault", default)]
    pub cv_generation_default: bool,
    #[serde(rename = "scoreGenerationDefault", default)]
    pub score_generation_default: bool,
    #[serde(rename = "coverGenerationDefault", default)]
    pub cover_generation_default: bool,
}

impl PromptDraft {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            cv_generation_default: false,
            score_generation_default: false,
            cover_generation_default: false,
        }
    }

    pub fn default_for(mut self, stage: Stage) -> Self {
        match stage {
            Stage::Cv => self.cv_generation_default = true,
            Stage::CoverLetter => self.cover_generation_default = true,
            Stage::Score => self.score_generation_default = true,
        }
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("prompt name is empty"));
        }
        if self.prompt.trim().is_empty() {
            return Err(DomainError::validation("prompt text is empty"));
        }
        Ok(())
    }

    pub fn with_id(self, id: PromptId) -> Prompt {
        Prompt {
            id,
            name: self.name,
            prompt: self.prompt,
            cv_generation_default: self.cv_generation_default,
            score_generation_default: self.score_generation_default,
            cover_generation_default: self.cover_generation_default,
        }
    }

    /// Stages this draft claims the default slot for.
    pub fn default_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| match stage {
                Stage::Cv => self.cv_generation_default,
                Stage::CoverLetter => self.cover_generation_default,
                Stage::Score => self.score_generation_default,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_map_to_stages() {
        let draft = PromptDraft::new("cv", "Write a CV").default_for(Stage::Cv);
        assert_eq!(draft.default_stages(), vec![Stage::Cv]);

        let prompt = draft.with_id(PromptId::new(4));
        assert!(prompt.is_default_for(Stage::Cv));
        assert!(!prompt.is_default_for(Stage::Score));
    }

    #[test]
    fn wire_names_are_camel_case_flags() {
        let prompt = PromptDraft::new("s", "p").default_for(Stage::Score).with_id(PromptId::new(1));
        let value = serde_json::to_value(&prompt).unwrap();
        assert_eq!(value["scoreGenerationDefault"], true);
        assert_eq!(value["cvGenerationDefault"], false);
    }

    #[test]
    fn empty_drafts_fail_validation() {
        assert!(PromptDraft::new("", "text").validate().is_err());
        assert!(PromptDraft::new("name", "").validate().is_err());
    }
}
