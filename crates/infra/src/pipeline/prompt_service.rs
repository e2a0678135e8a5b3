//! Prompt Service: applies prompt create/update requests from the log.

use async_trait::async_trait;
use tracing::info;

use applyflow_core::PromptDraft;
use applyflow_events::{event_type, Delivery, EventEnvelope, PromptUpdate};

use super::context::PipelineContext;
use super::harness::{HandlerError, MessageHandler};

/// Consumes `prompts.create_request`.
///
/// Creation carries no idempotency key, so a redelivered request after a
/// lost ack inserts a second prompt with the same attributes.
pub struct PromptCreationHandler {
    ctx: PipelineContext,
}

impl PromptCreationHandler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for PromptCreationHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let draft =
            EventEnvelope::<PromptDraft>::decode(&delivery.payload, event_type::PROMPT_CREATION_REQUEST)?.into_data();
        draft.validate()?;

        let prompt = self.ctx.prompts.insert_prompt(&draft).await?;
        info!(prompt_id = %prompt.id, name = %prompt.name, "prompt created");
        Ok(())
    }
}

/// Consumes `prompts.update_request`.
pub struct PromptUpdateHandler {
    ctx: PipelineContext,
}

impl PromptUpdateHandler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for PromptUpdateHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let update =
            EventEnvelope::<PromptUpdate>::decode(&delivery.payload, event_type::PROMPT_UPDATE_REQUEST)?.into_data();
        update.draft.validate()?;

        let prompt = self.ctx.prompts.update_prompt(update.id, &update.draft).await?;
        info!(prompt_id = %prompt.id, defaults = ?prompt_defaults(&update.draft), "prompt updated");
        Ok(())
    }
}

fn prompt_defaults(draft: &PromptDraft) -> Vec<&'static str> {
    draft.default_stages().into_iter().map(|s| s.name()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use applyflow_core::{PromptId, Stage};
    use applyflow_events::InMemoryEventLog;
    use chrono::Utc;

    use crate::store::{InMemoryFeatureStore, InMemoryJobStore, InMemoryPromptStore, PromptStore};

    fn ctx() -> (PipelineContext, Arc<InMemoryPromptStore>) {
        let prompts = Arc::new(InMemoryPromptStore::new());
        let ctx = PipelineContext::new(
            Arc::new(InMemoryEventLog::new()),
            Arc::new(InMemoryJobStore::new()),
            prompts.clone(),
            Arc::new(InMemoryFeatureStore::seeded()),
        );
        (ctx, prompts)
    }

    fn delivery(subject: &str, payload: Vec<u8>) -> Delivery {
        Delivery {
            stream: "JOBS".to_string(),
            durable: "prompt-consumer".to_string(),
            subject: subject.to_string(),
            message_id: "1".to_string(),
            payload,
            delivery_count: 1,
            published_at: Utc::now(),
        }
    }

    fn create(draft: PromptDraft) -> Delivery {
        let bytes = EventEnvelope::new(event_type::PROMPT_CREATION_REQUEST, draft).to_bytes().unwrap();
        delivery("prompts.create_request", bytes)
    }

    #[tokio::test]
    async fn create_then_update_moves_default() {
        let (ctx, prompts) = ctx();
        let create_handler = PromptCreationHandler::new(ctx.clone());
        create_handler
            .handle(&create(PromptDraft::new("first", "Write a CV").default_for(Stage::Cv)))
            .await
            .unwrap();
        create_handler
            .handle(&create(PromptDraft::new("second", "Write a better CV")))
            .await
            .unwrap();

        let second = PromptId::new(2);
        let update = PromptUpdate {
            id: second,
            draft: PromptDraft::new("second", "Write a better CV").default_for(Stage::Cv),
        };
        let bytes = EventEnvelope::new(event_type::PROMPT_UPDATE_REQUEST, update).to_bytes().unwrap();
        PromptUpdateHandler::new(ctx)
            .handle(&delivery("prompts.update_request", bytes))
            .await
            .unwrap();

        let default = prompts.default_prompt(Stage::Cv).await.unwrap().unwrap();
        assert_eq!(default.id, second);
        let first = prompts.get_prompt(PromptId::new(1)).await.unwrap().unwrap();
        assert!(!first.cv_generation_default);
    }

    #[tokio::test]
    async fn update_accepts_flat_wire_shape() {
        let (ctx, prompts) = ctx();
        prompts.insert_prompt(&PromptDraft::new("p", "text")).await.unwrap();
        let bytes = br#"{"type":"prompt_update_request","data":{"id":1,"name":"p","prompt":"new text","scoreGenerationDefault":true}}"#.to_vec();

        PromptUpdateHandler::new(ctx)
            .handle(&delivery("prompts.update_request", bytes))
            .await
            .unwrap();

        let prompt = prompts.get_prompt(PromptId::new(1)).await.unwrap().unwrap();
        assert_eq!(prompt.prompt, "new text");
        assert!(prompt.score_generation_default);
    }

    #[tokio::test]
    async fn empty_prompt_is_malformed() {
        let (ctx, prompts) = ctx();
        let err = PromptCreationHandler::new(ctx)
            .handle(&create(PromptDraft::new("name", "  ")))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
        assert!(prompts.get_prompt(PromptId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_prompt_is_retried() {
        let (ctx, _prompts) = ctx();
        let update = PromptUpdate {
            id: PromptId::new(9),
            draft: PromptDraft::new("p", "text"),
        };
        let bytes = EventEnvelope::new(event_type::PROMPT_UPDATE_REQUEST, update).to_bytes().unwrap();
        let err = PromptUpdateHandler::new(ctx)
            .handle(&delivery("prompts.update_request", bytes))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Precondition(_)));
    }
}
