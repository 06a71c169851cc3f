//! Translation of native transport shapes into [`Event`] envelopes.
//!
//! Every adapter funnels through these functions so the engine never sees a
//! transport-specific row layout.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::NormalizeError;
use crate::models::{Event, EventKind, Key, SourceChannel};
use crate::services::transport::{ChangeOperation, ChangeRecord};

pub const STATUS_RESOLVED: &str = "resolved";

/// Outcome of normalising one change-feed record.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Event(Event),
    /// An SOS row left the active state; recipients must stop alerting. The
    /// row is attached when it carries enough to build an envelope.
    Resolved { key: Key, event: Option<Event> },
    Ignored,
}

pub fn kind_for_table(table: &str) -> Result<EventKind, NormalizeError> {
    match table {
        "sos_events" => Ok(EventKind::Sos),
        "chat_messages" => Ok(EventKind::ChatMessage),
        other => Err(NormalizeError::UnsupportedTable(other.to_string())),
    }
}

pub fn normalize_change(kind: EventKind, record: &ChangeRecord) -> Result<Normalized, NormalizeError> {
    match record.operation {
        ChangeOperation::Insert => event_from_row(kind, &record.row, SourceChannel::Push).map(Normalized::Event),
        ChangeOperation::Update if is_resolved(&record.row) => {
            let id = required_id(&record.row, "id", "change")?;
            Ok(Normalized::Resolved {
                key: Key::logical(kind, &id),
                event: event_from_row(kind, &record.row, SourceChannel::Push).ok(),
            })
        }
        _ => Ok(Normalized::Ignored),
    }
}

/// Builds an authoritative envelope from a stored row (push or poll).
pub fn event_from_row(kind: EventKind, row: &Value, channel: SourceChannel) -> Result<Event, NormalizeError> {
    let source = kind.table();
    let id = required_id(row, "id", source)?;
    let origin = required_id(row, origin_column(kind), source)?;
    let created_at = timestamp(row)?;

    Ok(Event::confirmed(id, kind, origin, payload_from(kind, row), created_at, channel))
}

/// Builds a low-trust envelope from an SOS broadcast. The broadcast `id` is a
/// client-generated placeholder, so it becomes the local id.
///
/// Broadcasts may be incomplete: a missing `user_id` leaves the origin empty
/// (matched against any author), and a payload without any id is passed on
/// anonymously so it is still surfaced.
pub fn event_from_broadcast(payload: &Value) -> Result<Event, NormalizeError> {
    if !payload.is_object() {
        return Err(NormalizeError::InvalidField {
            field: "payload".to_string(),
            reason: "broadcast payload must be an object".to_string(),
        });
    }

    let local_id = optional_id(payload, "id");
    let origin = optional_id(payload, "user_id").unwrap_or_else(|| {
        debug!("Broadcast without user_id, origin unknown");
        String::new()
    });
    let created_at = timestamp(payload)?;

    Ok(Event {
        logical_id: None,
        local_id,
        kind: EventKind::Sos,
        origin_id: origin,
        payload: payload_from(EventKind::Sos, payload),
        created_at,
        source_channel: SourceChannel::Broadcast,
    })
}

pub fn is_resolved(row: &Value) -> bool {
    row.get("status").and_then(Value::as_str) == Some(STATUS_RESOLVED)
}

fn origin_column(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Sos => "user_id",
        EventKind::ChatMessage => "sender_id",
    }
}

fn payload_columns(kind: EventKind) -> &'static [&'static str] {
    match kind {
        EventKind::Sos => &["user_name", "latitude", "longitude", "emergency_type", "address", "status"],
        EventKind::ChatMessage => &["consultation_id", "message"],
    }
}

fn payload_from(kind: EventKind, row: &Value) -> Map<String, Value> {
    let mut payload = Map::new();
    for column in payload_columns(kind) {
        match row.get(*column) {
            None | Some(Value::Null) => {}
            // Coordinates are compared by value; 6 and 6.0 must be equal.
            Some(Value::Number(n)) if matches!(*column, "latitude" | "longitude") => {
                if let Some(value) = n.as_f64() {
                    payload.insert(column.to_string(), Value::from(value));
                }
            }
            Some(value) => {
                payload.insert(column.to_string(), value.clone());
            }
        }
    }
    payload
}

fn optional_id(row: &Value, field: &str) -> Option<String> {
    match row.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn required_id(row: &Value, field: &str, source: &str) -> Result<String, NormalizeError> {
    optional_id(row, field).ok_or_else(|| NormalizeError::MissingField {
        source_name: source.to_string(),
        field: field.to_string(),
    })
}

fn timestamp(row: &Value) -> Result<DateTime<Utc>, NormalizeError> {
    match row.get("created_at").and_then(Value::as_str) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| NormalizeError::InvalidField {
                field: "created_at".to_string(),
                reason: e.to_string(),
            }),
        None => {
            debug!("Payload without created_at, stamping with receive time");
            Ok(Utc::now())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn chat_row_becomes_confirmed_event() {
        let row = json!({
            "id": "R9",
            "consultation_id": "c1",
            "sender_id": "user-a",
            "message": "hello",
            "created_at": "2024-05-01T10:00:00.123456+00:00"
        });

        let event = event_from_row(EventKind::ChatMessage, &row, SourceChannel::Poll).unwrap();
        assert_eq!(event.logical_id.as_deref(), Some("R9"));
        assert_eq!(event.origin_id, "user-a");
        assert_eq!(event.text(), Some("hello"));
        assert_eq!(event.source_channel, SourceChannel::Poll);
        assert!(!event.payload.contains_key("id"));
    }

    #[test]
    fn row_without_sender_is_rejected() {
        let row = json!({"id": "R9", "message": "hello"});
        let err = event_from_row(EventKind::ChatMessage, &row, SourceChannel::Push).unwrap_err();
        assert_eq!(err, NormalizeError::MissingField {
            source_name: "chat_messages".into(),
            field: "sender_id".into(),
        });
    }

    #[test]
    fn broadcast_is_provisional_with_normalized_coordinates() {
        let payload = json!({
            "id": "tmp-1",
            "user_id": "patient-1",
            "user_name": "Ada",
            "latitude": 6,
            "longitude": 3.5,
            "emergency_type": "Medical Emergency",
            "created_at": "2024-05-01T10:00:00Z"
        });

        let event = event_from_broadcast(&payload).unwrap();
        assert!(event.is_provisional());
        assert_eq!(event.local_id.as_deref(), Some("tmp-1"));
        assert_eq!(event.payload["latitude"], Value::from(6.0));
    }

    #[test]
    fn portal_broadcast_without_user_id_has_unknown_origin() {
        let payload = json!({
            "id": "temp-1714557600000",
            "user_name": "Ada",
            "latitude": 6.5244,
            "longitude": 3.3792,
            "emergency_type": "Medical Emergency",
            "created_at": "2024-05-01T10:00:00Z"
        });

        let event = event_from_broadcast(&payload).unwrap();
        assert_eq!(event.local_id.as_deref(), Some("temp-1714557600000"));
        assert_eq!(event.origin_id, "");
        assert_eq!(event.payload["user_name"], "Ada");
    }

    #[test]
    fn broadcast_without_any_id_is_anonymous() {
        let event = event_from_broadcast(&json!({"user_id": "p1", "latitude": 6.5})).unwrap();
        assert_eq!(event.local_id, None);
        assert_eq!(event.logical_id, None);
        assert_eq!(event.origin_id, "p1");

        assert!(event_from_broadcast(&json!("sos")).is_err());
    }

    #[test]
    fn resolved_update_maps_to_resolution() {
        let record = ChangeRecord {
            operation: ChangeOperation::Update,
            table: "sos_events".into(),
            row: json!({"id": "S1", "user_id": "p", "status": "resolved"}),
        };
        assert_matches!(
            normalize_change(EventKind::Sos, &record).unwrap(),
            Normalized::Resolved { key, event: Some(event) } => {
                assert_eq!(key, Key::logical(EventKind::Sos, "S1"));
                assert_eq!(event.payload["status"], "resolved");
            }
        );

        let bare = ChangeRecord { row: json!({"id": "S1", "status": "resolved"}), ..record.clone() };
        assert_matches!(normalize_change(EventKind::Sos, &bare).unwrap(), Normalized::Resolved { event: None, .. });

        let delete = ChangeRecord { operation: ChangeOperation::Delete, ..record };
        assert_eq!(normalize_change(EventKind::Sos, &delete).unwrap(), Normalized::Ignored);
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let row = json!({"id": 42, "user_id": "p", "latitude": 1.0, "created_at": "2024-05-01T10:00:00Z"});
        let event = event_from_row(EventKind::Sos, &row, SourceChannel::Push).unwrap();
        assert_eq!(event.logical_id.as_deref(), Some("42"));
    }

    #[test]
    fn unknown_table_is_unsupported() {
        assert!(kind_for_table("appointments").is_err());
        assert_eq!(kind_for_table("sos_events").unwrap(), EventKind::Sos);
    }
}
