//! # Message Envelope
//!
//! Every message flooded through the mesh travels inside an [`Envelope`]: the
//! application event name and payload, tagged with a random identifier and
//! the creation time. The identifier is what the seen-message cache keys on,
//! so it is assigned exactly once, when the message is published, and never
//! changes as the envelope hops from node to node.
//!
//! ## Wire Format
//!
//! Envelopes are JSON objects with compact keys:
//!
//! ```text
//! { "id": "<uuid v4>", "e": "<event name>", "d": <payload>, "c": <unix ms> }
//! ```
//!
//! A frame without `id` or `e` is malformed and rejected by [`Envelope::decode`].
//! A missing `d` decodes as `null`; a missing `c` decodes as "now".

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::{MeshError, MeshResult};

// ---------------------------------------------------------------------------
// Message Identity
// ---------------------------------------------------------------------------

/// Globally unique message identifier.
///
/// Backed by a UUIDv4 (122 random bits from the OS entropy source), so two
/// nodes starting at the same instant cannot collide through a shared seed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for MessageId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| MeshError::MalformedEnvelope(format!("bad message id {s:?}: {e}")))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({})", self.0.simple())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// An application message tagged with identity and creation time.
///
/// Fields are private: an envelope is immutable once created. Relaying nodes
/// forward the exact same identity they received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "id")]
    id: MessageId,
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "d", default)]
    payload: Value,
    #[serde(
        rename = "c",
        with = "chrono::serde::ts_milliseconds",
        default = "created_now"
    )]
    created_at: DateTime<Utc>,
}

fn created_now() -> DateTime<Utc> {
    Utc::now()
}

impl Envelope {
    /// Wraps an event name and payload with a fresh id and the current time.
    pub fn wrap(event: impl Into<String>, payload: Value) -> Self {
        Self {
            id: MessageId::generate(),
            event: event.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Serializes `payload` to JSON and wraps it.
    pub fn wrap_serialize<T: Serialize + ?Sized>(
        event: impl Into<String>,
        payload: &T,
    ) -> MeshResult<Self> {
        let value =
            serde_json::to_value(payload).map_err(|e| MeshError::Serialization(e.to_string()))?;
        Ok(Self::wrap(event, value))
    }

    /// The message identifier.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The application event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Creation time, as stamped by the originating node.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Projects the application payload out of the envelope.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Encodes the envelope into its JSON wire representation.
    pub fn encode(&self) -> MeshResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }

    /// Decodes an envelope from raw bytes received on a peer link.
    ///
    /// Rejects frames that are not JSON objects, lack an `id` or `e` field,
    /// or carry an empty event name.
    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;

        if envelope.event.is_empty() {
            return Err(MeshError::MalformedEnvelope("empty event name".into()));
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrap_assigns_distinct_ids() {
        let a = Envelope::wrap("ping", json!({ "n": 1 }));
        let b = Envelope::wrap("ping", json!({ "n": 1 }));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.payload(), b.payload());
    }

    #[test]
    fn payload_projection_does_not_mutate() {
        let envelope = Envelope::wrap("chat", json!("hello"));
        let before = envelope.clone();
        assert_eq!(envelope.payload(), &json!("hello"));
        assert_eq!(envelope, before);
    }

    #[test]
    fn wire_format_uses_compact_keys() {
        let envelope = Envelope::wrap("ping", json!({ "n": 1 }));
        let bytes = envelope.encode().unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(raw["id"], json!(envelope.id().to_string()));
        assert_eq!(raw["e"], json!("ping"));
        assert_eq!(raw["d"], json!({ "n": 1 }));
        assert_eq!(raw["c"], json!(envelope.created_at().timestamp_millis()));
    }

    #[test]
    fn decode_preserves_identity_and_timestamp() {
        let envelope = Envelope::wrap("ping", json!([1, 2, 3]));
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded.id(), envelope.id());
        assert_eq!(decoded.event(), "ping");
        assert_eq!(
            decoded.created_at().timestamp_millis(),
            envelope.created_at().timestamp_millis()
        );
    }

    #[test]
    fn decode_rejects_missing_id() {
        let frame = br#"{"e":"ping","d":1,"c":0}"#;
        assert!(matches!(
            Envelope::decode(frame),
            Err(MeshError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_event_name() {
        let frame = format!(r#"{{"id":"{}","d":1,"c":0}}"#, MessageId::generate());
        assert!(Envelope::decode(frame.as_bytes()).is_err());
    }

    #[test]
    fn decode_rejects_empty_event_name() {
        let frame = format!(r#"{{"id":"{}","e":"","d":1}}"#, MessageId::generate());
        assert!(Envelope::decode(frame.as_bytes()).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Envelope::decode(b"\x00\x01not json").is_err());
        assert!(Envelope::decode(b"[1,2,3]").is_err());
    }

    #[test]
    fn missing_payload_decodes_as_null() {
        let frame = format!(r#"{{"id":"{}","e":"tick","c":1700000000000}}"#, MessageId::generate());
        let envelope = Envelope::decode(frame.as_bytes()).unwrap();
        assert_eq!(envelope.payload(), &Value::Null);
        assert_eq!(envelope.created_at().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn wrap_serialize_accepts_structs() {
        #[derive(Serialize)]
        struct Ping {
            n: u32,
        }

        let envelope = Envelope::wrap_serialize("ping", &Ping { n: 7 }).unwrap();
        assert_eq!(envelope.payload(), &json!({ "n": 7 }));
    }

    #[test]
    fn message_id_parses_its_display_form() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<MessageId>().is_err());
    }
}
