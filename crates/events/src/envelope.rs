use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire envelope for every message on the log: `{"type": <tag>, "data": <payload>}`.
///
/// The tag names the payload shape; the subject a message is published on
/// is transport metadata and is not repeated inside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    #[serde(rename = "type")]
    event_type: String,
    data: T,
}

/// A payload that could not be turned into the expected envelope.
///
/// Always permanent: the same bytes will never decode on redelivery.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected event type {found:?} (expected {expected:?})")]
    UnexpectedType { expected: String, found: String },
}

impl<T> EventEnvelope<T> {
    pub fn new(event_type: impl Into<String>, data: T) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T: Serialize> EventEnvelope<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    /// Decode `bytes` and require the envelope to carry `expected_type`.
    pub fn decode(bytes: &[u8], expected_type: &str) -> Result<Self, DecodeError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.event_type != expected_type {
            return Err(DecodeError::UnexpectedType {
                expected: expected_type.to_string(),
                found: envelope.event_type,
            });
        }
        Ok(envelope)
    }
}
