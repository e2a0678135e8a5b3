//! Event log abstraction and pipeline wire format.

pub mod envelope;
pub mod in_memory_log;
pub mod log;
pub mod payload;
pub mod subject;

pub use envelope::{DecodeError, EventEnvelope};
pub use in_memory_log::InMemoryEventLog;
pub use log::{ConsumerConfig, Delivery, EventLog, LogError, RetentionPolicy, StreamConfig};
pub use payload::{event_type, DeadLetter, GenerateRequest, PromptUpdate, StatusUpdateRequest};
pub use subject::{subject_matches, validate_pattern, validate_subject};
