//! The Encode/Decode collaborator (spec §1, out-of-scope-but-consumed).
//!
//! `Socket` never serializes JSON itself; it calls through a [`Codec`]. The
//! default [`JsonCodec`] is what every production deployment uses — the
//! abstraction exists purely for pluggability/testing, matching how the
//! original design calls out Encode/Decode as external collaborators.

use std::sync::Arc;

use crate::error::CodecError;
use crate::message::Message;

pub trait Codec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<String, CodecError>;
    fn decode(&self, text: &str) -> Result<Message, CodecError>;
}

#[derive(Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<String, CodecError> {
        serde_json::to_string(message).map_err(CodecError::Encode)
    }

    fn decode(&self, text: &str) -> Result<Message, CodecError> {
        serde_json::from_str(text).map_err(CodecError::Decode)
    }
}

pub(crate) fn default_codec() -> Arc<dyn Codec> {
    Arc::new(JsonCodec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{event, Ref};
    use serde_json::json;

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let msg = Message::new(
            Some(Ref::for_test(1)),
            Some(Ref::for_test(2)),
            "rooms:lobby",
            event::REPLY,
            json!({"status": "ok", "response": {}}),
        );

        let encoded = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_failure_does_not_panic() {
        let codec = JsonCodec;
        assert!(codec.decode("not json").is_err());
        assert!(codec.decode(r#"{"not": "an array"}"#).is_err());
    }
}
