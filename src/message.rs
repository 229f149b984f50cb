//! The serializer v2 wire frame: a 5-element JSON array.
//!
//! ```text
//! [join_ref_or_null, ref_or_null, topic, event, payload_object]
//! ```

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Reserved lifecycle event names (spec §3).
pub mod event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";

    /// Whether `event` is one of the reserved channel lifecycle events.
    pub fn is_lifecycle(event: &str) -> bool {
        matches!(event, JOIN | LEAVE | REPLY | ERROR | CLOSE)
    }
}

/// The `phoenix` topic heartbeats are addressed to.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// An opaque, strictly non-decreasing request identifier.
///
/// Wraps a `u64` counter but is carried on the wire as a decimal string, per
/// spec §3 ("opaque decimal strings").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ref(u64);

impl Ref {
    pub const ZERO: Ref = Ref(0);

    /// Returns the next ref in sequence, wrapping to zero on overflow.
    #[must_use]
    pub fn wrapping_next(self) -> Self {
        Ref(self.0.wrapping_add(1))
    }

    /// Only meant for tests that need to construct a specific ref.
    pub fn for_test(id: u64) -> Self {
        Ref(id)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Ref {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RefVisitor;

        impl de::Visitor<'_> for RefVisitor {
            type Value = Ref;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal string or integer ref")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Ref, E> {
                v.parse::<u64>().map(Ref).map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Ref, E> {
                Ok(Ref(v))
            }
        }

        deserializer.deserialize_any(RefVisitor)
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub join_ref: Option<Ref>,
    pub ref_: Option<Ref>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Message {
    pub fn new(
        join_ref: Option<Ref>,
        ref_: Option<Ref>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            ref_,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn heartbeat(ref_: Ref) -> Self {
        Self::new(
            None,
            Some(ref_),
            HEARTBEAT_TOPIC,
            event::HEARTBEAT,
            Value::Object(Default::default()),
        )
    }

    pub fn is_reply(&self) -> bool {
        self.event == event::REPLY
    }

    /// Parses a `phx_reply` payload into its status/response parts.
    ///
    /// Invariant (spec §3): a frame whose `event == "phx_reply"` has a
    /// non-null `ref` and a `status`. Callers are expected to have already
    /// checked `ref_.is_some()`; this only parses the payload shape.
    pub fn as_reply(&self) -> Option<ReplyPayload> {
        if !self.is_reply() {
            return None;
        }

        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// The `{"status": ..., "response": ...}` shape of a `phx_reply` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(5))?;
        seq.serialize_element(&self.join_ref)?;
        seq.serialize_element(&self.ref_)?;
        seq.serialize_element(&self.topic)?;
        seq.serialize_element(&self.event)?;
        seq.serialize_element(&self.payload)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MessageVisitor;

        impl<'de> Visitor<'de> for MessageVisitor {
            type Value = Message;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 5-element [join_ref, ref, topic, event, payload] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Message, A::Error> {
                let join_ref: Option<Ref> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let ref_: Option<Ref> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let topic: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let event: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                let payload: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(4, &self))?;

                if seq.next_element::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(6, &self));
                }

                Ok(Message {
                    join_ref,
                    ref_,
                    topic,
                    event,
                    payload,
                })
            }
        }

        deserializer.deserialize_seq(MessageVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ref_wraps_on_overflow() {
        let max = Ref(u64::MAX);
        assert_eq!(max.wrapping_next(), Ref::ZERO);
    }

    #[test]
    fn ref_serializes_as_decimal_string() {
        let r = Ref::for_test(6);
        assert_eq!(serde_json::to_string(&r).unwrap(), r#""6""#);
    }

    #[test]
    fn round_trips_inbound_message() {
        let raw = r#"["1","6","rooms:lobby","new_msg",{"body":"hi"}]"#;
        let msg: Message = serde_json::from_str(raw).unwrap();

        assert_eq!(msg.join_ref, Some(Ref::for_test(1)));
        assert_eq!(msg.ref_, Some(Ref::for_test(6)));
        assert_eq!(msg.topic, "rooms:lobby");
        assert_eq!(msg.event, "new_msg");
        assert_eq!(msg.payload, json!({"body": "hi"}));

        let encoded = serde_json::to_string(&msg).unwrap();
        let round_tripped: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(round_tripped, msg);
    }

    #[test]
    fn heartbeat_has_null_join_ref() {
        let raw = r#"[null,"3","phoenix","heartbeat",{}]"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.join_ref, None);
        assert_eq!(msg.topic, HEARTBEAT_TOPIC);
        assert_eq!(msg.event, event::HEARTBEAT);
    }

    #[test]
    fn reply_payload_flattens_response() {
        let raw = r#"[null,"3","rooms:lobby","phx_reply",{"status":"ok","response":{"a":1}}]"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        let reply = msg.as_reply().expect("should parse as a reply");
        assert!(reply.is_ok());
        assert_eq!(reply.response, json!({"a": 1}));
    }

    #[test]
    fn rejects_short_arrays() {
        let raw = r#"["1","6","rooms:lobby"]"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn rejects_long_arrays() {
        let raw = r#"["1","6","rooms:lobby","new_msg",{},"extra"]"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn lifecycle_event_classification() {
        assert!(event::is_lifecycle(event::JOIN));
        assert!(event::is_lifecycle(event::CLOSE));
        assert!(!event::is_lifecycle("new_msg"));
    }
}
