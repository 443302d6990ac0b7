//! Event representation
//!
//! Unified event structure for all change notifications delivered by the
//! remote backend.
//!
//! ## Sequence markers
//!
//! Every event carries a monotonically non-decreasing sequence marker:
//! - **Backend-assigned**: the store's own change ordinal, when it has one
//! - **Arrival-assigned**: the mesh numbers events in arrival order when the
//!   backend provides none
//!
//! Markers drive duplicate/stale detection in the materialized view layer,
//! so they are assigned exactly once, at parse time, and never rewritten.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw change notification as delivered by the remote backend.
///
/// The body is expected to carry a `type` string and a `payload` object;
/// anything else is rejected at parse time, before any schema is consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNotification {
    /// Source path/collection in the remote backend
    pub source_path: String,
    /// Backend-assigned sequence marker, if the backend provides one
    pub sequence: Option<u64>,
    /// Unparsed notification body
    pub body: Value,
}

impl RawNotification {
    /// Create a notification without a backend-assigned sequence marker.
    pub fn new(source_path: impl Into<String>, body: Value) -> Self {
        Self {
            source_path: source_path.into(),
            sequence: None,
            body,
        }
    }

    /// Set the backend-assigned sequence marker.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Parse into an immutable [`Event`].
    ///
    /// Structural checks run first; `assign_sequence` is only consulted when
    /// the notification is well-formed and the backend supplied no marker,
    /// so malformed input never consumes an arrival ordinal.
    pub fn parse(
        self,
        assign_sequence: impl FnOnce() -> u64,
    ) -> Result<Event, ValidationError> {
        let event_type = match self.body.get("type") {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            _ => {
                return Err(ValidationError::malformed(self.source_path.as_str(), "type"));
            }
        };

        let payload = match self.body.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            _ => {
                return Err(ValidationError::malformed(self.source_path.as_str(), "payload"));
            }
        };

        let sequence = self.sequence.unwrap_or_else(assign_sequence);

        Ok(Event {
            event_type,
            payload,
            source_path: self.source_path,
            sequence,
        })
    }
}

/// An immutable, validated-shape event.
///
/// Events are never mutated after creation; once routed they are either
/// accepted or rejected, never re-validated later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type identifier (e.g. `"order.created"`)
    pub event_type: String,
    /// Field name → value mapping
    pub payload: Map<String, Value>,
    /// Source path/collection the notification originated from
    pub source_path: String,
    /// Monotonically non-decreasing sequence marker
    pub sequence: u64,
}

impl Event {
    /// Construct an event directly. Mostly useful in tests and rebuilds;
    /// the normal path is [`RawNotification::parse`].
    pub fn new(
        event_type: impl Into<String>,
        payload: Map<String, Value>,
        source_path: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source_path: source_path.into(),
            sequence,
        }
    }

    /// Look up a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_well_formed() {
        let raw = RawNotification::new(
            "orders/incoming",
            json!({"type": "order.created", "payload": {"order_id": "A1"}}),
        )
        .with_sequence(7);

        let event = raw.parse(|| unreachable!("backend marker present")).unwrap();
        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.sequence, 7);
        assert_eq!(event.source_path, "orders/incoming");
        assert_eq!(event.field("order_id"), Some(&json!("A1")));
    }

    #[test]
    fn test_parse_assigns_arrival_sequence() {
        let raw = RawNotification::new(
            "orders/incoming",
            json!({"type": "order.created", "payload": {}}),
        );

        let event = raw.parse(|| 42).unwrap();
        assert_eq!(event.sequence, 42);
    }

    #[test]
    fn test_parse_missing_type() {
        let raw = RawNotification::new("orders/incoming", json!({"payload": {}}));
        let err = raw.parse(|| 1).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Malformed { ref field, .. } if field == &"type"
        ));
    }

    #[test]
    fn test_parse_non_string_type() {
        let raw = RawNotification::new(
            "orders/incoming",
            json!({"type": 17, "payload": {}}),
        );
        assert!(raw.parse(|| 1).is_err());
    }

    #[test]
    fn test_parse_missing_payload() {
        let raw =
            RawNotification::new("orders/incoming", json!({"type": "order.created"}));
        let err = raw.parse(|| 1).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Malformed { ref field, .. } if field == &"payload"
        ));
    }

    #[test]
    fn test_parse_payload_must_be_object() {
        let raw = RawNotification::new(
            "orders/incoming",
            json!({"type": "order.created", "payload": [1, 2, 3]}),
        );
        assert!(raw.parse(|| 1).is_err());
    }

    #[test]
    fn test_malformed_does_not_consume_sequence() {
        let raw = RawNotification::new("orders/incoming", json!({"payload": {}}));
        let mut consumed = false;
        let _ = raw.parse(|| {
            consumed = true;
            1
        });
        assert!(!consumed);
    }
}
