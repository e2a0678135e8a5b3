//! Local Ollama `/api/generate` provider (non-streaming).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::generator::{error_for_status, GenerationError, Generator};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3";

#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

impl OllamaGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    #[instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()), err)]
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
        };
        let response = self.client.post(self.endpoint()).json(&body).send().await?;
        let response = error_for_status(response).await?;
        let parsed: OllamaResponse = response.json().await?;
        if parsed.response.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(parsed.response)
    }

    fn describe(&self) -> String {
        format!("ollama:{}", self.model)
    }
}
