// Message serializer
// Turns structured messages into wire payloads and back, validating the envelope

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{SerializerConfig, WireFormat};
use crate::models::{MessageType, Payload};

/// Why a payload could not be turned back into JSON.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] DecodeError),
}

#[derive(Debug, Clone, Default)]
pub struct Serializer {
    config: SerializerConfig,
}

impl Serializer {
    pub fn new(config: SerializerConfig) -> Self {
        Serializer { config }
    }

    pub fn config(&self) -> &SerializerConfig {
        &self.config
    }

    /// Encode `message`, validating the envelope first when validation is on.
    pub fn serialize<T: Serialize + ?Sized>(&self, message: &T) -> Result<Payload, SerializerError> {
        let value = serde_json::to_value(message).map_err(SerializerError::Serialization)?;
        if self.config.validate {
            validate(&value)?;
        }

        let text = serde_json::to_string(&value).map_err(SerializerError::Serialization)?;
        Ok(match self.config.format {
            WireFormat::Text => Payload::Text(text),
            WireFormat::Binary => Payload::Binary(text.into_bytes()),
        })
    }

    /// Decode and validate `payload`, then convert it into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, SerializerError> {
        let value = self.decode(payload)?;
        if self.config.validate {
            validate(&value)?;
        }
        serde_json::from_value(value).map_err(|e| SerializerError::Deserialization(e.into()))
    }

    /// Parse `payload` as JSON without validating it.
    pub fn decode(&self, payload: &Payload) -> Result<Value, SerializerError> {
        Ok(decode_json(payload)?)
    }
}

/// Parse a text or binary payload as JSON. Binary payloads must be UTF-8.
pub fn decode_json(payload: &Payload) -> Result<Value, DecodeError> {
    match payload {
        Payload::Text(text) => Ok(serde_json::from_str(text)?),
        Payload::Binary(bytes) => {
            let text = std::str::from_utf8(bytes)?;
            Ok(serde_json::from_str(text)?)
        }
    }
}

/// Check the wire envelope. Heartbeat, connect and command frames only need a known type.
pub fn validate(value: &Value) -> Result<(), SerializerError> {
    let object = value
        .as_object()
        .ok_or_else(|| SerializerError::Validation("message must be a JSON object".to_string()))?;

    let type_name = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SerializerError::Validation("missing message type".to_string()))?;
    let message_type = MessageType::from_wire(type_name).ok_or_else(|| {
        SerializerError::Validation(format!("unknown message type '{}'", type_name))
    })?;
    if message_type.is_control() {
        return Ok(());
    }

    require_string(object, "id", "id")?;
    require_string(object, "conversation_id", "conversation_id")?;

    let sender = object
        .get("sender")
        .and_then(Value::as_object)
        .ok_or_else(|| SerializerError::Validation("missing sender".to_string()))?;
    require_string(sender, "id", "sender.id")?;

    Ok(())
}

fn require_string(object: &Map<String, Value>, key: &str, label: &str) -> Result<(), SerializerError> {
    match object.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err(SerializerError::Validation(format!("missing or empty {}", label))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalMessage, Sender, SenderType};
    use serde_json::json;

    fn sample() -> CanonicalMessage {
        let mut message = CanonicalMessage::text("conv-1", Sender::new("u1", SenderType::User), "hello");
        message.is_important = Some(true);
        message
    }

    #[test]
    fn test_round_trip_text() {
        let serializer = Serializer::default();
        let message = sample();

        let payload = serializer.serialize(&message).unwrap();
        assert!(matches!(payload, Payload::Text(_)));

        let back: CanonicalMessage = serializer.deserialize(&payload).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_round_trip_binary() {
        let serializer = Serializer::new(SerializerConfig {
            validate: true,
            format: WireFormat::Binary,
        });
        let message = sample();

        let payload = serializer.serialize(&message).unwrap();
        let Payload::Binary(bytes) = &payload else {
            panic!("expected a binary payload");
        };
        assert!(std::str::from_utf8(bytes).unwrap().contains("\"conversation_id\":\"conv-1\""));

        let back: CanonicalMessage = serializer.deserialize(&payload).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_validation_rejects_incomplete_envelopes() {
        let serializer = Serializer::default();

        let missing_sender = json!({"id": "1", "conversation_id": "c", "type": "text"});
        assert!(matches!(
            serializer.serialize(&missing_sender),
            Err(SerializerError::Validation(_))
        ));

        let empty_id = json!({"id": "", "conversation_id": "c", "type": "text", "sender": {"id": "u"}});
        assert!(matches!(
            serializer.serialize(&empty_id),
            Err(SerializerError::Validation(_))
        ));

        let unknown_type = json!({"id": "1", "conversation_id": "c", "type": "sticker", "sender": {"id": "u"}});
        assert!(matches!(
            serializer.serialize(&unknown_type),
            Err(SerializerError::Validation(_))
        ));

        assert!(matches!(
            serializer.serialize(&json!(["not", "an", "object"])),
            Err(SerializerError::Validation(_))
        ));
    }

    #[test]
    fn test_control_frames_skip_envelope_checks() {
        let serializer = Serializer::default();
        for kind in ["heartbeat", "connect", "command"] {
            assert!(serializer.serialize(&json!({"type": kind})).is_ok(), "{}", kind);
        }
    }

    #[test]
    fn test_control_frames_deserialize_without_envelope() {
        let serializer = Serializer::default();
        for kind in ["heartbeat", "connect", "command"] {
            let payload = Payload::Text(format!("{{\"type\":\"{}\"}}", kind));
            let value: Value = serializer.deserialize(&payload).unwrap();
            assert_eq!(value, json!({"type": kind}));
        }

        let err = serializer
            .deserialize::<Value>(&Payload::Text("{\"type\":\"text\"}".to_string()))
            .unwrap_err();
        assert!(matches!(err, SerializerError::Validation(_)));
    }

    #[test]
    fn test_validation_can_be_disabled() {
        let serializer = Serializer::new(SerializerConfig {
            validate: false,
            format: WireFormat::Text,
        });
        let payload = serializer.serialize(&json!({"anything": 1})).unwrap();
        assert_eq!(payload, Payload::Text("{\"anything\":1}".to_string()));
    }

    #[test]
    fn test_deserialize_wraps_parse_failures() {
        let serializer = Serializer::default();

        let err = serializer
            .deserialize::<Value>(&Payload::Text("{oops".to_string()))
            .unwrap_err();
        assert!(matches!(err, SerializerError::Deserialization(DecodeError::Json(_))));
        assert!(std::error::Error::source(&err).is_some());

        let err = serializer
            .deserialize::<Value>(&Payload::Binary(vec![0xff, 0xfe]))
            .unwrap_err();
        assert!(matches!(err, SerializerError::Deserialization(DecodeError::Utf8(_))));
    }

    #[test]
    fn test_decode_does_not_validate() {
        let serializer = Serializer::default();
        let value = serializer
            .decode(&Payload::Text("{\"msg\":\"hi\"}".to_string()))
            .unwrap();
        assert_eq!(value, json!({"msg": "hi"}));
    }
}
