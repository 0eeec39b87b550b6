//! Event model and the wire envelope codec.
//!
//! Every event crosses the backend as a versioned JSON envelope:
//!
//! ```text
//! {"v":1,"id":"0195…","type":"room:42:joined","origin":"node-a","ts":"2026-…Z","data":{…}}
//! ```
//!
//! The event type travels twice: once in the channel name (authoritative, see
//! [`crate::channel`]) and once in the envelope. A mismatch between the two is
//! a decode error, which keeps a misrouted or forged payload from reaching
//! subscribers of the wrong type.
//!
//! ## Schema Evolution
//!
//! - `v` starts at `1` and increments on breaking envelope changes.
//! - Unknown envelope fields are ignored (forward compatibility).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// An event published on the bus. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Hierarchical event type (e.g., `"room:42:joined"`).
    pub event_type: String,
    /// Schema-less payload.
    pub data: Value,
    /// Identifier of the publishing process.
    pub origin: String,
    /// When the event was published (UTC).
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with a fresh UUIDv7 and the current time.
    pub fn new(event_type: impl Into<String>, data: Value, origin: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            data,
            origin: origin.into(),
            timestamp: Utc::now(),
        }
    }

    /// Milliseconds elapsed since the event was published, clamped at zero.
    pub fn age_ms(&self) -> u64 {
        (Utc::now() - self.timestamp).num_milliseconds().max(0) as u64
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    id: Uuid,
    #[serde(rename = "type")]
    event_type: &'a str,
    origin: &'a str,
    ts: DateTime<Utc>,
    data: &'a Value,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    id: Uuid,
    #[serde(rename = "type")]
    event_type: String,
    origin: String,
    ts: DateTime<Utc>,
    data: Value,
}

/// Encode an event into its wire envelope.
pub fn encode_event(event: &Event) -> Result<Vec<u8>> {
    let envelope = EnvelopeRef {
        v: ENVELOPE_VERSION,
        id: event.event_id,
        event_type: &event.event_type,
        origin: &event.origin,
        ts: event.timestamp,
        data: &event.data,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode a wire envelope received on the direct channel for `event_type`.
///
/// Malformed JSON, an unsupported version, or a type that disagrees with the
/// channel all yield [`Error::Decode`].
pub fn decode_event(event_type: &str, payload: &[u8]) -> Result<Event> {
    let envelope: Envelope = serde_json::from_slice(payload)
        .map_err(|e| Error::Decode(format!("malformed envelope: {}", e)))?;

    if envelope.v != ENVELOPE_VERSION {
        return Err(Error::Decode(format!(
            "unsupported envelope version {} (expected {})",
            envelope.v, ENVELOPE_VERSION
        )));
    }
    if envelope.event_type != event_type {
        return Err(Error::Decode(format!(
            "envelope type {:?} does not match channel type {:?}",
            envelope.event_type, event_type
        )));
    }

    Ok(Event {
        event_id: envelope.id,
        event_type: envelope.event_type,
        data: envelope.data,
        origin: envelope.origin,
        timestamp: envelope.ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_new_defaults() {
        let event = Event::new("room:42:joined", json!({"user": "a"}), "node-a");
        assert_eq!(event.event_type, "room:42:joined");
        assert_eq!(event.origin, "node-a");
        assert_eq!(event.event_id.get_version_num(), 7);
        assert!(event.age_ms() < 5_000);
    }

    #[test]
    fn test_envelope_roundtrip_preserves_event() {
        let event = Event::new(
            "workspace:loaded",
            json!({
                "id": "ws-1",
                "members": ["a", "b"],
                "quota": {"bytes": 1_073_741_824u64, "ratio": 0.1},
                "active": true,
                "note": null
            }),
            "node-a",
        );
        let bytes = encode_event(&event).unwrap();
        let decoded = decode_event("workspace:loaded", &bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_envelope_roundtrip_scalar_payloads() {
        for data in [json!(null), json!(42), json!(-3.25), json!("text"), json!([])] {
            let event = Event::new("t", data.clone(), "o");
            let decoded = decode_event("t", &encode_event(&event).unwrap()).unwrap();
            assert_eq!(decoded.data, data);
        }
    }

    #[test]
    fn test_envelope_wire_shape() {
        let event = Event::new("svc.updated", json!({"k": 1}), "node-b");
        let bytes = encode_event(&event).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["v"], 1);
        assert_eq!(parsed["type"], "svc.updated");
        assert_eq!(parsed["origin"], "node-b");
        assert_eq!(parsed["data"]["k"], 1);
        assert!(parsed["id"].is_string());
        assert!(parsed["ts"].is_string());
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = decode_event("t", b"{not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        let err = decode_event("t", &[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let err = decode_event("t", br#"{"v":1,"type":"t","data":{}}"#).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let event = Event::new("t", json!({}), "o");
        let mut value: Value = serde_json::from_slice(&encode_event(&event).unwrap()).unwrap();
        value["v"] = json!(2);
        let err = decode_event("t", &serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(err.to_string().contains("unsupported envelope version"));
    }

    #[test]
    fn test_decode_rejects_type_mismatch() {
        let event = Event::new("room:1", json!({}), "o");
        let bytes = encode_event(&event).unwrap();
        let err = decode_event("room:2", &bytes).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let event = Event::new("t", json!({"x": 1}), "o");
        let mut value: Value = serde_json::from_slice(&encode_event(&event).unwrap()).unwrap();
        value["trace"] = json!("abc");
        let decoded = decode_event("t", &serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
