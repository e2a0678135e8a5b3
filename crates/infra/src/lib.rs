//! Infrastructure layer: event log adapters, stores, configuration and the
//! enrichment pipeline built on them.

pub mod config;
pub mod event_log;
pub mod pdf;
pub mod pipeline;
pub mod retry;
pub mod store;


pub use config::{ConfigError, PipelineConfig};
pub use retry::{retry_with_backoff, BackoffStrategy, RetryPolicy};
