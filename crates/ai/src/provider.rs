use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::gemini::{GeminiGenerator, DEFAULT_GEMINI_MODEL};
use crate::generator::{GenerationError, Generator};
use crate::ollama::{OllamaGenerator, DEFAULT_OLLAMA_MODEL, DEFAULT_OLLAMA_URL};

/// HTTP client timeout applied to every generation call.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gemini,
    Ollama,
}

impl FromStr for Provider {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "ollama" => Ok(Provider::Ollama),
            other => Err(GenerationError::Config(format!("unknown generation provider {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    pub provider: Provider,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Gemini,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
            timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }
}

pub fn build_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>, GenerationError> {
    match config.provider {
        Provider::Gemini => {
            let key = config
                .gemini_api_key
                .clone()
                .ok_or_else(|| GenerationError::Config("GEMINI_API_KEY is not set".to_string()))?;
            Ok(Arc::new(GeminiGenerator::new(key, config.gemini_model.clone(), config.timeout)?))
        }
        Provider::Ollama => Ok(Arc::new(OllamaGenerator::new(
            config.ollama_url.clone(),
            config.ollama_model.clone(),
            config.timeout,
        )?)),
    }
}
