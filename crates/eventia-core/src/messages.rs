//! Event messages exchanged with storage engines.
//!
//! [`DomainEventMessage`] is what the event-sourcing core hands to storage on
//! append; [`TrackedDomainEventMessage`] is what comes back on read, stamped with
//! the time storage logged it and the token a reader resumes from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::token::ResumptionToken;

/// An event raised by an aggregate, ready to be stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEventMessage {
    /// Globally unique event identifier.
    pub identifier: String,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Aggregate instance identifier.
    pub aggregate_identifier: String,
    /// Position of the event within its aggregate.
    pub sequence_number: i64,
    /// Payload type name.
    pub payload_type: String,
    /// Event payload.
    pub payload: Value,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl DomainEventMessage {
    /// Create an event with a fresh `UUIDv7` identifier and no metadata.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_identifier: impl Into<String>,
        sequence_number: i64,
        payload_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            identifier: Uuid::now_v7().to_string(),
            aggregate_type: aggregate_type.into(),
            aggregate_identifier: aggregate_identifier.into(),
            sequence_number,
            payload_type: payload_type.into(),
            payload,
            metadata: None,
        }
    }

    /// Replace the generated identifier.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A stored event read back from the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedDomainEventMessage {
    /// The event as it was appended, with storage-side metadata merged in.
    #[serde(flatten)]
    pub event: DomainEventMessage,
    /// When storage logged the event.
    pub timestamp: DateTime<Utc>,
    /// Token recording this event as consumed.
    pub tracking_token: ResumptionToken,
}

/// How a read should behave once it reaches the end of the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Stop at the last stored event.
    #[default]
    Historical,
    /// Block and keep yielding events as they are appended.
    Live,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
