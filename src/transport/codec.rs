//! Event envelope and codec boundary
//!
//! Events travel as opaque frames; the codec is injected so applications can
//! swap the wire format without touching the fabric. The default codec is
//! JSON over text frames.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Result, WsError};

/// Typed event envelope carried over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Dispatch key
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque application payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Encoder/decoder between events and opaque frames
pub trait EventCodec: Send + Sync + fmt::Debug {
    fn encode(&self, event: &Event) -> Result<Vec<u8>>;
    fn decode(&self, frame: &[u8]) -> Result<Event>;

    /// Whether encoded frames are valid UTF-8 and should travel as text
    fn text_frames(&self) -> bool {
        true
    }
}

/// JSON codec over text frames
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventCodec;

impl EventCodec for JsonEventCodec {
    fn encode(&self, event: &Event) -> Result<Vec<u8>> {
        serde_json::to_vec(event).map_err(|e| WsError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<Event> {
        serde_json::from_slice(frame).map_err(|e| WsError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonEventCodec;
        let event = Event::new("state.delta", serde_json::json!({"k": "v", "n": 3}));

        let frame = codec.encode(&event).unwrap();
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_wire_shape_uses_type_key() {
        let codec = JsonEventCodec;
        let frame = codec
            .encode(&Event::new("ping", serde_json::Value::Null))
            .unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(raw["type"], "ping");
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let codec = JsonEventCodec;
        let err = codec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, WsError::Decode(_)));
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let codec = JsonEventCodec;
        let event = codec.decode(br#"{"type":"bare"}"#).unwrap();
        assert_eq!(event.event_type, "bare");
        assert!(event.payload.is_null());
    }
}
