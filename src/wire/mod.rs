// Wire format handling: envelope serialization and inbound normalization

use serde_json::Value;

pub mod adapter;
pub mod serializer;

pub use adapter::{MessageAdapter, DEFAULT_CONVERSATION_ID};
pub use serializer::{decode_json, validate, DecodeError, Serializer, SerializerError};

/// Frame types that acknowledge a heartbeat ping.
pub const HEARTBEAT_ACK_TYPES: [&str; 3] = ["heartbeat", "pong", "heartbeat_ack"];

/// Whether a decoded frame is heartbeat traffic rather than a chat message.
pub fn is_heartbeat(value: &Value) -> bool {
    value
        .get("type")
        .and_then(Value::as_str)
        .map_or(false, |t| HEARTBEAT_ACK_TYPES.contains(&t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_heartbeat() {
        assert!(is_heartbeat(&json!({"type": "pong"})));
        assert!(is_heartbeat(&json!({"type": "heartbeat_ack", "id": "x"})));
        assert!(!is_heartbeat(&json!({"type": "text"})));
        assert!(!is_heartbeat(&json!("pong")));
    }
}
