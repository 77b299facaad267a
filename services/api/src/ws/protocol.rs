//! Defines the WebSocket wire format between clients and the relay server.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Kind of an outbound envelope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboundType {
    Heartbeat,
    Message,
    Error,
}

impl OutboundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundType::Heartbeat => "heartbeat",
            OutboundType::Message => "message",
            OutboundType::Error => "error",
        }
    }
}

/// A message sent from the server to a client: `{"type": .., "data": ..}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: OutboundType,
    pub data: String,
}

impl OutboundMessage {
    pub fn new(kind: OutboundType, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::new(OutboundType::Error, data)
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "type": self.kind.as_str(), "data": self.data }).to_string()
    }
}

/// A text frame sent from a client: `{"type": .., "body": <raw JSON>}`.
///
/// The body is kept raw so each handler decodes only what it owns.
#[derive(Deserialize, Debug)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub body: Option<Box<RawValue>>,
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The raw body text, `null` when the client omitted it.
    pub fn body_str(&self) -> &str {
        self.body.as_deref().map(RawValue::get).unwrap_or("null")
    }
}

/// Body of a `"speech"` envelope.
#[derive(Deserialize, Debug, PartialEq, Eq)]
pub struct SpeechCommand {
    pub action: String,
}

/// Payload of a speech result, carried as the `data` string of a `"message"`
/// envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SpeechResult {
    pub content: String,
    pub is_end: bool,
}

impl SpeechResult {
    /// The empty, non-terminal result used to acknowledge a start request.
    pub fn ack() -> Self {
        Self {
            content: String::new(),
            is_end: false,
        }
    }

    pub fn into_message(self) -> OutboundMessage {
        let data = serde_json::json!({ "content": self.content, "is_end": self.is_end });
        OutboundMessage::new(OutboundType::Message, data.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_uses_type_and_data_fields() {
        let json: serde_json::Value =
            serde_json::from_str(&OutboundMessage::error("boom").to_json()).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "error", "data": "boom" }));
    }

    #[test]
    fn ack_is_empty_and_not_final() {
        let message = SpeechResult::ack().into_message();
        assert_eq!(message.kind, OutboundType::Message);
        let result: SpeechResult = serde_json::from_str(&message.data).unwrap();
        assert_eq!(result.content, "");
        assert!(!result.is_end);
    }

    #[test]
    fn inbound_keeps_body_raw() {
        let envelope =
            InboundEnvelope::parse(r#"{"type":"speech","body":{"action":"start"}}"#).unwrap();
        assert_eq!(envelope.kind, "speech");
        let command: SpeechCommand = serde_json::from_str(envelope.body_str()).unwrap();
        assert_eq!(command.action, "start");
    }

    #[test]
    fn inbound_body_is_optional() {
        let envelope = InboundEnvelope::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(envelope.kind, "heartbeat");
        assert_eq!(envelope.body_str(), "null");
    }

    #[test]
    fn inbound_without_type_is_rejected() {
        assert!(InboundEnvelope::parse(r#"{"body":{}}"#).is_err());
        assert!(InboundEnvelope::parse("not json").is_err());
    }
}
