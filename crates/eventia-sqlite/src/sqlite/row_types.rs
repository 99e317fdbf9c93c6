//! Physical row shape of the `Events` table.
//!
//! Columns are read by name, so `SELECT *` works regardless of column order.
//! Conversion to [`TrackedDomainEventMessage`] happens here as well, since it
//! only depends on the row.

use chrono::{DateTime, Utc};
use eventia_core::{DomainEventMessage, Position, ResumptionToken, TrackedDomainEventMessage};
use rusqlite::Row;
use serde_json::{Map, Value};

use crate::errors::{Result, StorageError};

/// Raw event row from the `Events` table.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEventRow {
    /// Event identifier (`Id`).
    pub identifier: String,
    /// Global position.
    pub position: Position,
    /// When storage logged the event, RFC 3339 text.
    pub log_date: String,
    /// Tenant the event was written for.
    pub tenant_identifier: Option<String>,
    /// User the event was written by.
    pub user_identifier: Option<String>,
    /// Aggregate instance identifier.
    pub aggregate_identifier: String,
    /// Position within the aggregate.
    pub sequence_number: i64,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Payload type name.
    pub payload_type: String,
    /// Payload JSON.
    pub payload: Value,
    /// Metadata JSON.
    pub metadata: Value,
}

impl StoredEventRow {
    /// Map a `SELECT *` row from `Events`.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identifier: row.get("Id")?,
            position: row.get("Position")?,
            log_date: row.get("LogDate")?,
            tenant_identifier: row.get("TenantIdentifier")?,
            user_identifier: row.get("UserIdentifier")?,
            aggregate_identifier: row.get("AggregateIdentifier")?,
            sequence_number: row.get("SequenceNumber")?,
            aggregate_type: row.get("AggregateType")?,
            payload_type: row.get("PayloadType")?,
            payload: row.get("Payload")?,
            metadata: row.get("Metadata")?,
        })
    }

    /// Parsed log date.
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.log_date)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                StorageError::InvalidArgument(format!(
                    "event {} has malformed LogDate {:?}: {e}",
                    self.identifier, self.log_date
                ))
            })
    }

    /// Convert into a tracked message whose token records this row as consumed.
    ///
    /// Tenant and user identifiers are merged into the metadata as `tenantId`
    /// and `userId`.
    pub fn into_tracked_message(self) -> Result<TrackedDomainEventMessage> {
        let timestamp = self.timestamp()?;

        let mut metadata = match self.metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                let _ = map.insert("value".into(), other);
                map
            }
        };
        if let Some(tenant) = self.tenant_identifier {
            let _ = metadata.insert("tenantId".into(), Value::String(tenant));
        }
        if let Some(user) = self.user_identifier {
            let _ = metadata.insert("userId".into(), Value::String(user));
        }

        Ok(TrackedDomainEventMessage {
            event: DomainEventMessage {
                identifier: self.identifier,
                aggregate_type: self.aggregate_type,
                aggregate_identifier: self.aggregate_identifier,
                sequence_number: self.sequence_number,
                payload_type: self.payload_type,
                payload: self.payload,
                metadata: Some(metadata),
            },
            timestamp,
            tracking_token: ResumptionToken::Positional(self.position),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> StoredEventRow {
        StoredEventRow {
            identifier: "evt-1".into(),
            position: 17,
            log_date: "2024-05-06T07:08:09.010Z".into(),
            tenant_identifier: None,
            user_identifier: None,
            aggregate_identifier: "order-1".into(),
            sequence_number: 2,
            aggregate_type: "Order".into(),
            payload_type: "OrderShipped".into(),
            payload: json!({"carrier": "ups"}),
            metadata: json!({"correlationId": "c-9"}),
        }
    }

    #[test]
    fn tracked_message_carries_positional_token() {
        let tracked = row().into_tracked_message().unwrap();
        assert_eq!(tracked.tracking_token, ResumptionToken::Positional(17));
        assert_eq!(tracked.event.identifier, "evt-1");
        assert_eq!(tracked.event.aggregate_type, "Order");
        assert_eq!(tracked.event.payload["carrier"], "ups");
        assert_eq!(tracked.timestamp.to_rfc3339(), "2024-05-06T07:08:09.010+00:00");
    }

    #[test]
    fn tenant_and_user_merge_into_metadata() {
        let mut stored = row();
        stored.tenant_identifier = Some("tenant-a".into());
        stored.user_identifier = Some("user-b".into());

        let metadata = stored.into_tracked_message().unwrap().event.metadata.unwrap();
        assert_eq!(metadata["correlationId"], "c-9");
        assert_eq!(metadata["tenantId"], "tenant-a");
        assert_eq!(metadata["userId"], "user-b");
    }

    #[test]
    fn null_metadata_becomes_empty_map() {
        let mut stored = row();
        stored.metadata = Value::Null;
        let metadata = stored.into_tracked_message().unwrap().event.metadata.unwrap();
        assert!(metadata.is_empty());
    }

    #[test]
    fn malformed_log_date_is_rejected() {
        let mut stored = row();
        stored.log_date = "yesterday".into();
        let err = stored.into_tracked_message().unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }
}
