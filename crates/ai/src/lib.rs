//! `applyflow-ai`
//!
//! **Responsibility:** generation collaborator boundary.
//!
//! Workers see a single synchronous-looking call, `generate(prompt)`.
//! Provider request/response framing (Gemini, Ollama) stays in this crate.

pub mod gemini;
pub mod generator;
pub mod ollama;
pub mod provider;

pub use gemini::GeminiGenerator;
pub use generator::{GenerationError, Generator};
pub use ollama::OllamaGenerator;
pub use provider::{build_generator, GenerationConfig, Provider};
