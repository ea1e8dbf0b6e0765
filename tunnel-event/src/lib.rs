//! Tunnel Event Model
//!
//! This module defines the event envelope carried through the tunnel pipeline.
//! An envelope is a `topic` plus a `payload` string that must itself hold a
//! JSON document. Envelopes travel as one JSON object per line.

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

/// Topic used for envelopes synthesized from malformed input
pub const ERROR_TOPIC: &str = "error";

/// Reason embedded in the payload of a synthesized error envelope
pub const INVALID_EVENT_REASON: &str = "invalid_event";

/// A single visitor event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event category
    #[serde(default)]
    pub topic: String,

    /// JSON document serialized as a string
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Parse and validate a raw line.
    ///
    /// Succeeds only for envelopes that satisfy [`is_valid_event`].
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        // serde would also accept a positional array for a struct
        if !raw.trim_start().starts_with('{') {
            return Err(EnvelopeError::Malformed("not a JSON object".to_string()));
        }
        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check the topic and payload invariants
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.topic.trim().is_empty() {
            return Err(EnvelopeError::EmptyTopic);
        }
        if self.payload.trim().is_empty() {
            return Err(EnvelopeError::EmptyPayload);
        }
        if !is_valid_json(&self.payload) {
            return Err(EnvelopeError::PayloadNotJson);
        }
        Ok(())
    }

    /// Whether the envelope satisfies the topic and payload invariants
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Build the standardized error envelope for a rejected raw line
    pub fn invalid_event(original: &str) -> Self {
        let payload = InvalidEventPayload {
            reason: INVALID_EVENT_REASON,
            original,
        };
        Self::new(ERROR_TOPIC, to_json(&payload))
    }

    /// Whether this is a synthesized error envelope
    pub fn is_error(&self) -> bool {
        self.topic == ERROR_TOPIC
    }

    /// Serialize to a single log line (no trailing newline)
    pub fn to_line(&self) -> String {
        to_json(self)
    }
}

/// Payload of a synthesized error envelope.
///
/// Field order is part of the wire format.
#[derive(Serialize)]
struct InvalidEventPayload<'a> {
    reason: &'a str,
    original: &'a str,
}

// Only used for structs of plain strings, which always serialize.
fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Whether `s` is a syntactically valid JSON document
pub fn is_valid_json(s: &str) -> bool {
    serde_json::from_str::<IgnoredAny>(s).is_ok()
}

/// Classify a raw line as a well-formed envelope.
///
/// Never fails: any parse problem classifies the line as invalid.
pub fn is_valid_event(raw: &str) -> bool {
    Envelope::parse(raw).is_ok()
}

/// Reasons a raw line is not a valid envelope
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Envelope topic is empty")]
    EmptyTopic,

    #[error("Envelope payload is empty")]
    EmptyPayload,

    #[error("Envelope payload is not valid JSON")]
    PayloadNotJson,
}
