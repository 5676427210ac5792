//! Domain error types.

use event_bus::EventType;
use thiserror::Error;

/// An event body did not match the shape its type dictates.
#[derive(Debug, Error)]
#[error("Malformed {event_type} payload: {source}")]
pub struct DecodeError {
    pub event_type: EventType,
    #[source]
    pub source: serde_json::Error,
}

/// A command was rejected before reaching the write store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
