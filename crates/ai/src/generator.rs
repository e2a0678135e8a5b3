use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Transport failure, including the client timeout.
    #[error("request failed: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("provider returned no text")]
    EmptyResponse,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GenerationError::InvalidResponse(err.to_string())
        } else {
            GenerationError::Request(err.to_string())
        }
    }
}

/// Text generation collaborator.
///
/// A single call with no retries of its own; callers treat every error as
/// retryable and rely on message redelivery.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Short provider/model label for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl<G> Generator for Arc<G>
where
    G: Generator + ?Sized,
{
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        (**self).generate(prompt).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

pub(crate) async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GenerationError::Status {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}
