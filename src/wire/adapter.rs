//! Inbound message normalization.
//!
//! Servers in the wild disagree on field names, type spellings and sender
//! shapes. `MessageAdapter` tries a fixed sequence of interpretations
//! (canonical, content, system, service, generic) and maps the first one
//! whose guard matches onto a `CanonicalMessage`. It never fails: anything
//! it cannot make sense of becomes a System message describing the problem,
//! with the error and the original payload in its metadata.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use lazy_static::lazy_static;
use log::{debug, trace, warn};
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::serializer::decode_json;
use crate::models::{now_timestamp, CanonicalMessage, MessageType, Payload, Sender, SenderType};

/// Conversation id given to messages that do not name one.
pub const DEFAULT_CONVERSATION_ID: &str = "default";

const ID_KEYS: &[&str] = &["id", "messageId", "message_id", "msgId", "msg_id", "_id"];
const CONVERSATION_KEYS: &[&str] = &[
    "conversation_id",
    "conversationId",
    "sessionId",
    "session_id",
    "chatId",
    "chat_id",
    "roomId",
    "room_id",
];
const TYPE_KEYS: &[&str] = &["type", "messageType", "message_type", "msgType"];
const CONTENT_KEYS: &[&str] = &["content", "text", "body", "message", "msg", "data", "payload"];
const TIMESTAMP_KEYS: &[&str] = &[
    "timestamp",
    "time",
    "createdAt",
    "created_at",
    "sendTime",
    "send_time",
];
const IMPORTANT_KEYS: &[&str] = &["isImportant", "is_important", "important"];

const SENDER_OBJECT_KEYS: &[&str] = &["sender", "from", "author"];
const SENDER_ID_KEYS: &[&str] = &["id", "userId", "user_id", "senderId", "uid"];
const SENDER_TYPE_KEYS: &[&str] = &["type", "role", "userType", "senderType", "user_type"];
const SENDER_NAME_KEYS: &[&str] = &["name", "nickname", "nickName", "userName", "username", "displayName"];
const SENDER_AVATAR_KEYS: &[&str] = &["avatar", "avatarUrl", "avatar_url", "headImg", "icon"];

const FLAT_ID_KEYS: &[&str] = &["userId", "user_id", "senderId", "sender_id", "fromId", "from_id", "uid"];
const FLAT_TYPE_KEYS: &[&str] = &[
    "userType",
    "user_type",
    "senderType",
    "sender_type",
    "role",
    "fromType",
];
const FLAT_NAME_KEYS: &[&str] = &["senderName", "sender_name", "userName", "nickname", "nickName"];
const FLAT_AVATAR_KEYS: &[&str] = &["senderAvatar", "avatar", "avatarUrl"];

/// Epoch values above this are taken as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

lazy_static! {
    static ref IMAGE_CONTENT: Regex =
        Regex::new(r"(?i)\.(png|jpe?g|gif|webp|bmp|svg|heic)(\?.*)?$").expect("valid image pattern");
    static ref AUDIO_CONTENT: Regex =
        Regex::new(r"(?i)\.(mp3|wav|ogg|m4a|aac|amr|flac|silk|opus)(\?.*)?$").expect("valid audio pattern");
}

#[derive(Debug, Error)]
enum AdaptError {
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("field '{0}' has an unusable shape")]
    BadField(String),

    #[error("payload is not valid JSON: {0}")]
    Decode(String),

    #[error("canonical message could not be read: {0}")]
    Canonical(String),
}

type Object = Map<String, Value>;
type Guard = fn(&Object) -> bool;
type Mapper = fn(&Object) -> Result<CanonicalMessage, AdaptError>;

/// Interpretations in priority order. The first one whose guard matches and
/// whose mapping succeeds wins; a failed mapping falls through to the next.
const INTERPRETATIONS: [(&str, Guard, Mapper); 5] = [
    ("canonical", is_canonical, map_canonical),
    ("content", is_content, map_content),
    ("system", is_system, map_system),
    ("service", is_service, map_service),
    ("generic", always, map_generic),
];

#[derive(Debug, Clone, Default)]
pub struct MessageAdapter;

impl MessageAdapter {
    pub fn new() -> Self {
        MessageAdapter
    }

    /// Normalize a decoded payload. Never fails.
    pub fn adapt(&self, raw: &Value) -> CanonicalMessage {
        match try_adapt(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Could not adapt inbound message: {}", e);
                failure_message(&e, raw)
            }
        }
    }

    /// Normalize a raw transport payload, treating unparseable input as a failure.
    pub fn adapt_payload(&self, payload: &Payload) -> CanonicalMessage {
        match decode_json(payload) {
            Ok(value) => self.adapt(&value),
            Err(e) => {
                let error = AdaptError::Decode(e.to_string());
                warn!("Could not adapt inbound payload: {}", error);
                let original = Value::String(String::from_utf8_lossy(payload.as_bytes()).into_owned());
                failure_message(&error, &original)
            }
        }
    }
}

fn try_adapt(raw: &Value) -> Result<CanonicalMessage, AdaptError> {
    let object = raw
        .as_object()
        .ok_or_else(|| AdaptError::NotAnObject(json_kind(raw)))?;

    let mut last_error = None;
    for (name, guard, mapper) in INTERPRETATIONS.iter() {
        if !guard(object) {
            continue;
        }
        trace!("Adapting inbound message as {}", name);
        match mapper(object) {
            Ok(message) => return Ok(message),
            Err(e) => {
                debug!("Message does not fit the {} interpretation: {}", name, e);
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) => Err(e),
        None => map_generic(object),
    }
}

// Guards

fn is_canonical(object: &Object) -> bool {
    let has_string = |key: &str| object.get(key).map_or(false, Value::is_string);
    let sender_ok = object
        .get("sender")
        .and_then(Value::as_object)
        .map_or(false, |sender| {
            sender.get("id").map_or(false, Value::is_string)
                && sender
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(SenderType::from_wire)
                    .is_some()
        });
    let type_ok = object
        .get("type")
        .and_then(Value::as_str)
        .and_then(MessageType::from_wire)
        .is_some();

    let timestamp_ok = object
        .get("timestamp")
        .and_then(Value::as_str)
        .map_or(false, |t| DateTime::parse_from_rfc3339(t).is_ok());

    has_string("id")
        && (has_string("conversation_id") || has_string("conversationId"))
        && timestamp_ok
        && type_ok
        && sender_ok
}

fn is_content(object: &Object) -> bool {
    declared_type(object).map_or(false, |t| t.is_content())
}

fn is_system(object: &Object) -> bool {
    declared_type(object) == Some(MessageType::System)
}

fn is_service(object: &Object) -> bool {
    declared_type(object).map_or(false, |t| t.is_control())
}

fn always(_: &Object) -> bool {
    true
}

// Mappers

fn map_canonical(object: &Object) -> Result<CanonicalMessage, AdaptError> {
    serde_json::from_value(Value::Object(object.clone())).map_err(|e| AdaptError::Canonical(e.to_string()))
}

fn map_content(object: &Object) -> Result<CanonicalMessage, AdaptError> {
    let message_type = declared_type(object).unwrap_or(MessageType::Text);
    build(object, message_type, false)
}

fn map_system(object: &Object) -> Result<CanonicalMessage, AdaptError> {
    build(object, MessageType::System, true)
}

fn map_service(object: &Object) -> Result<CanonicalMessage, AdaptError> {
    let message_type = declared_type(object).unwrap_or(MessageType::Command);
    build(object, message_type, true)
}

fn map_generic(object: &Object) -> Result<CanonicalMessage, AdaptError> {
    let content = first(object, CONTENT_KEYS);
    let message_type = content
        .and_then(Value::as_str)
        .map(sniff_content_type)
        .unwrap_or(MessageType::Text);
    let mut message = build(object, message_type, false)?;

    // Keep an unrecognised declared type around for consumers that know it
    if let Some(original) = first(object, TYPE_KEYS).and_then(Value::as_str) {
        message
            .metadata
            .get_or_insert_with(Map::new)
            .insert("originalType".to_string(), Value::String(original.to_string()));
    }
    Ok(message)
}

fn build(object: &Object, message_type: MessageType, system: bool) -> Result<CanonicalMessage, AdaptError> {
    let id = string_field(object, ID_KEYS)?.unwrap_or_else(|| Uuid::new_v4().to_string());
    let conversation_id =
        string_field(object, CONVERSATION_KEYS)?.unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string());
    let sender = normalize_sender(object)?.unwrap_or_else(Sender::system);
    let timestamp = normalize_timestamp(first(object, TIMESTAMP_KEYS));
    let content = first(object, CONTENT_KEYS).cloned().unwrap_or(Value::Null);
    let metadata = object.get("metadata").and_then(Value::as_object).cloned();

    Ok(CanonicalMessage {
        id,
        conversation_id,
        content,
        message_type,
        sender,
        timestamp,
        is_important: important_flag(object),
        is_system_message: if system { Some(true) } else { None },
        metadata,
    })
}

fn failure_message(error: &AdaptError, original: &Value) -> CanonicalMessage {
    let conversation_id = original
        .as_object()
        .and_then(|object| string_field(object, CONVERSATION_KEYS).ok().flatten())
        .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string());

    let mut metadata = Map::new();
    metadata.insert("error".to_string(), Value::String(error.to_string()));
    metadata.insert("original".to_string(), original.clone());

    CanonicalMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id,
        content: Value::String(format!("Failed to adapt message: {}", error)),
        message_type: MessageType::System,
        sender: Sender::system(),
        timestamp: now_timestamp(),
        is_important: None,
        is_system_message: Some(true),
        metadata: Some(metadata),
    }
}

// Field helpers

fn first<'a>(object: &'a Object, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

/// First present key as a string. Numbers are accepted; other shapes are errors.
fn string_field(object: &Object, keys: &[&str]) -> Result<Option<String>, AdaptError> {
    for key in keys {
        match object.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) if s.is_empty() => continue,
            Some(Value::String(s)) => return Ok(Some(s.clone())),
            Some(Value::Number(n)) => return Ok(Some(n.to_string())),
            Some(_) => return Err(AdaptError::BadField((*key).to_string())),
        }
    }
    Ok(None)
}

/// Like `string_field`, for optional cosmetic fields where a bad shape is ignored.
fn lenient_string(object: &Object, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    })
}

fn declared_type(object: &Object) -> Option<MessageType> {
    first(object, TYPE_KEYS)
        .and_then(Value::as_str)
        .and_then(normalize_message_type)
}

fn normalize_message_type(raw: &str) -> Option<MessageType> {
    let t = raw.trim().to_ascii_lowercase();
    let message_type = match t.as_str() {
        "text" | "txt" | "msg" | "chat" | "plain" => MessageType::Text,
        "image" | "img" | "picture" | "pic" | "photo" => MessageType::Image,
        "voice" | "audio" | "sound" | "record" => MessageType::Voice,
        "system" | "sys" | "notice" | "notification" => MessageType::System,
        "connect" | "connection" | "connected" | "join" => MessageType::Connect,
        "heartbeat" | "ping" | "pong" | "heartbeat_ack" | "keepalive" => MessageType::Heartbeat,
        "command" | "cmd" | "action" => MessageType::Command,
        _ => return None,
    };
    Some(message_type)
}

fn sniff_content_type(content: &str) -> MessageType {
    let content = content.trim();
    if IMAGE_CONTENT.is_match(content) {
        MessageType::Image
    } else if AUDIO_CONTENT.is_match(content) {
        MessageType::Voice
    } else {
        MessageType::Text
    }
}

fn normalize_sender_type(raw: &str) -> Option<SenderType> {
    let t = raw.trim().to_ascii_lowercase();
    let sender_type = match t.as_str() {
        "user" | "member" | "visitor" | "guest" | "human" => SenderType::User,
        "customer" | "client" | "patient" => SenderType::Customer,
        "consultant" | "advisor" | "adviser" | "counselor" | "agent" | "staff" => SenderType::Consultant,
        "doctor" | "physician" | "expert" => SenderType::Doctor,
        "ai" | "bot" | "assistant" | "robot" | "gpt" | "llm" => SenderType::AI,
        "system" | "sys" | "server" | "platform" => SenderType::System,
        _ => return None,
    };
    Some(sender_type)
}

/// A bare string is either a role ("bot") or, failing that, a user id.
fn sender_from_str(raw: &str) -> Option<Sender> {
    if raw.trim().is_empty() {
        return None;
    }
    Some(match normalize_sender_type(raw) {
        Some(sender_type) => Sender::new(sender_type.as_str(), sender_type),
        None => Sender::new(raw.trim(), SenderType::User),
    })
}

fn sender_from_object(sender: &Object, flat: &Object) -> Result<Sender, AdaptError> {
    let sender_type = lenient_string(sender, SENDER_TYPE_KEYS)
        .or_else(|| lenient_string(flat, FLAT_TYPE_KEYS))
        .map(|t| normalize_sender_type(&t).unwrap_or(SenderType::User));
    let id = match string_field(sender, SENDER_ID_KEYS)? {
        Some(id) => Some(id),
        None => string_field(flat, FLAT_ID_KEYS)?,
    };

    let (id, sender_type) = match (id, sender_type) {
        (Some(id), sender_type) => (id, sender_type.unwrap_or(SenderType::User)),
        (None, Some(sender_type)) => (sender_type.as_str().to_string(), sender_type),
        (None, None) => ("unknown".to_string(), SenderType::User),
    };

    Ok(Sender {
        id,
        sender_type,
        name: lenient_string(sender, SENDER_NAME_KEYS).or_else(|| lenient_string(flat, FLAT_NAME_KEYS)),
        avatar: lenient_string(sender, SENDER_AVATAR_KEYS).or_else(|| lenient_string(flat, FLAT_AVATAR_KEYS)),
    })
}

fn normalize_sender(object: &Object) -> Result<Option<Sender>, AdaptError> {
    let candidates = SENDER_OBJECT_KEYS.iter().chain(std::iter::once(&"user"));
    for key in candidates {
        match object.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Object(sender)) => return sender_from_object(sender, object).map(Some),
            Some(Value::String(raw)) => {
                if let Some(sender) = sender_from_str(raw) {
                    return Ok(Some(sender));
                }
            }
            Some(_) => return Err(AdaptError::BadField((*key).to_string())),
        }
    }

    // Flat fields on the message itself
    let id = string_field(object, FLAT_ID_KEYS)?;
    let sender_type = lenient_string(object, FLAT_TYPE_KEYS).map(|t| normalize_sender_type(&t).unwrap_or(SenderType::User));
    let (id, sender_type) = match (id, sender_type) {
        (Some(id), sender_type) => (id, sender_type.unwrap_or(SenderType::User)),
        (None, Some(sender_type)) => (sender_type.as_str().to_string(), sender_type),
        (None, None) => return Ok(None),
    };

    Ok(Some(Sender {
        id,
        sender_type,
        name: lenient_string(object, FLAT_NAME_KEYS),
        avatar: lenient_string(object, FLAT_AVATAR_KEYS),
    }))
}

/// RFC 3339 strings are kept as sent; epoch numbers (also as strings) are converted.
/// Anything else becomes the current time.
fn normalize_timestamp(raw: Option<&Value>) -> String {
    let converted = match raw {
        Some(Value::String(s)) => {
            let s = s.trim();
            if DateTime::parse_from_rfc3339(s).is_ok() {
                Some(s.to_string())
            } else {
                s.parse::<i64>().ok().and_then(epoch_to_rfc3339)
            }
        }
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(epoch_to_rfc3339),
        _ => None,
    };
    converted.unwrap_or_else(now_timestamp)
}

fn epoch_to_rfc3339(value: i64) -> Option<String> {
    let millis = if value.unsigned_abs() >= MILLIS_THRESHOLD as u64 {
        value
    } else {
        value.checked_mul(1000)?
    };
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn important_flag(object: &Object) -> Option<bool> {
    IMPORTANT_KEYS.iter().find_map(|key| match object.get(*key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::Number(n)) => Some(n.as_i64().map_or(false, |i| i != 0)),
        Some(Value::String(s)) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapt(value: Value) -> CanonicalMessage {
        MessageAdapter::new().adapt(&value)
    }

    #[test]
    fn test_canonical_passes_through() {
        let mut original = CanonicalMessage::text("c1", Sender::new("u1", SenderType::Doctor), "hi");
        original.metadata = Some(Map::from_iter([("k".to_string(), json!(1))]));
        let value = serde_json::to_value(&original).unwrap();

        assert_eq!(adapt(value), original);
    }

    #[test]
    fn test_synonym_type_and_bare_sender_string() {
        let message = adapt(json!({"type": "txt", "user": "bot", "content": "hi"}));

        assert_eq!(message.message_type, MessageType::Text);
        assert_eq!(message.sender.sender_type, SenderType::AI);
        assert_eq!(message.content, json!("hi"));
        assert_eq!(message.conversation_id, DEFAULT_CONVERSATION_ID);
        assert!(!message.id.is_empty());
    }

    #[test]
    fn test_content_message_maps_alternate_fields() {
        let message = adapt(json!({
            "msgType": "img",
            "messageId": 42,
            "sessionId": "room-7",
            "body": "https://cdn.example.com/a.png",
            "senderId": "d-1",
            "senderType": "physician",
            "senderName": "Dr. Who",
            "createdAt": 1_700_000_000,
            "important": true
        }));

        assert_eq!(message.message_type, MessageType::Image);
        assert_eq!(message.id, "42");
        assert_eq!(message.conversation_id, "room-7");
        assert_eq!(message.sender.id, "d-1");
        assert_eq!(message.sender.sender_type, SenderType::Doctor);
        assert_eq!(message.sender.name.as_deref(), Some("Dr. Who"));
        assert_eq!(message.timestamp, "2023-11-14T22:13:20.000Z");
        assert_eq!(message.is_important, Some(true));
    }

    #[test]
    fn test_extreme_epoch_values_fall_back_to_now() {
        for raw in [json!(i64::MIN), json!(-1e300), json!(1e300), json!(u64::MAX)] {
            let message = adapt(json!({"type": "text", "content": "x", "timestamp": raw}));
            assert_eq!(message.message_type, MessageType::Text);
            assert!(DateTime::parse_from_rfc3339(&message.timestamp).is_ok(), "{}", raw);
        }
    }

    #[test]
    fn test_unparseable_timestamp_strings_are_replaced() {
        let message = adapt(json!({"type": "text", "content": "x", "timestamp": "yesterday"}));
        assert_ne!(message.timestamp, "yesterday");
        assert!(DateTime::parse_from_rfc3339(&message.timestamp).is_ok());

        let message = adapt(json!({"type": "text", "content": "x", "timestamp": "1700000000"}));
        assert_eq!(message.timestamp, "2023-11-14T22:13:20.000Z");

        let message = adapt(json!({"type": "text", "content": "x", "timestamp": "2024-05-01T10:00:00+02:00"}));
        assert_eq!(message.timestamp, "2024-05-01T10:00:00+02:00");
    }

    #[test]
    fn test_canonical_with_unusable_optional_field_keeps_content() {
        let mut message = serde_json::to_value(CanonicalMessage::text(
            "c1",
            Sender::new("u1", SenderType::User),
            "still here",
        ))
        .unwrap();
        message["metadata"] = json!("not-an-object");
        let adapted = adapt(message.clone());
        assert_eq!(adapted.message_type, MessageType::Text);
        assert_eq!(adapted.content, json!("still here"));
        assert_eq!(adapted.id, message["id"].as_str().unwrap());
        assert_eq!(adapted.conversation_id, "c1");
        assert_eq!(adapted.metadata, None);

        message["metadata"] = Value::Null;
        message["sender"]["name"] = json!(5);
        let adapted = adapt(message.clone());
        assert_eq!(adapted.message_type, MessageType::Text);
        assert_eq!(adapted.content, json!("still here"));
        assert_eq!(adapted.sender, Sender::new("u1", SenderType::User));
        assert_eq!(adapted.timestamp, message["timestamp"].as_str().unwrap());
    }

    #[test]
    fn test_millisecond_timestamps() {
        let message = adapt(json!({"type": "text", "text": "x", "time": 1_700_000_000_123i64}));
        assert_eq!(message.timestamp, "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn test_sender_object_with_role_synonym() {
        let message = adapt(json!({
            "type": "voice",
            "content": "clip.amr",
            "from": {"uid": "c-9", "role": "client", "avatarUrl": "https://a/b.png"}
        }));

        assert_eq!(message.message_type, MessageType::Voice);
        assert_eq!(message.sender.id, "c-9");
        assert_eq!(message.sender.sender_type, SenderType::Customer);
        assert_eq!(message.sender.avatar.as_deref(), Some("https://a/b.png"));
    }

    #[test]
    fn test_unknown_sender_type_defaults_to_user() {
        let message = adapt(json!({"type": "text", "content": "x", "sender": {"id": "z", "type": "martian"}}));
        assert_eq!(message.sender.sender_type, SenderType::User);
        assert_eq!(message.sender.id, "z");
    }

    #[test]
    fn test_system_and_service_messages_default_to_system_sender() {
        let system = adapt(json!({"type": "notice", "message": "maintenance at 5"}));
        assert_eq!(system.message_type, MessageType::System);
        assert_eq!(system.sender, Sender::system());
        assert_eq!(system.is_system_message, Some(true));
        assert_eq!(system.content, json!("maintenance at 5"));

        let service = adapt(json!({"type": "ping"}));
        assert_eq!(service.message_type, MessageType::Heartbeat);
        assert_eq!(service.sender, Sender::system());
    }

    #[test]
    fn test_generic_mapping_sniffs_content() {
        let image = adapt(json!({"payload": "https://x/y/photo.JPG?size=2", "userId": "u"}));
        assert_eq!(image.message_type, MessageType::Image);
        assert_eq!(image.sender, Sender::new("u", SenderType::User));

        let audio = adapt(json!({"data": "note.mp3", "type": "attachment"}));
        assert_eq!(audio.message_type, MessageType::Voice);
        assert_eq!(
            audio.metadata.as_ref().and_then(|m| m.get("originalType")),
            Some(&json!("attachment"))
        );

        let text = adapt(json!({"text": "plain words"}));
        assert_eq!(text.message_type, MessageType::Text);
        assert_eq!(text.sender, Sender::system());
    }

    #[test]
    fn test_malformed_payloads_become_system_messages() {
        for raw in [json!("just a string"), json!([1, 2, 3]), json!({"id": [1], "text": "x"})] {
            let message = adapt(raw.clone());
            assert_eq!(message.message_type, MessageType::System);
            assert_eq!(message.sender.sender_type, SenderType::System);
            let metadata = message.metadata.expect("failure metadata");
            assert!(metadata.get("error").and_then(Value::as_str).is_some());
            assert_eq!(metadata.get("original"), Some(&raw));
        }
    }

    #[test]
    fn test_adapt_payload_handles_unparseable_input() {
        let adapter = MessageAdapter::new();

        let ok = adapter.adapt_payload(&Payload::Text(r#"{"type":"text","content":"yo"}"#.to_string()));
        assert_eq!(ok.content, json!("yo"));

        let bad = adapter.adapt_payload(&Payload::Text("not json".to_string()));
        assert_eq!(bad.message_type, MessageType::System);
        let metadata = bad.metadata.unwrap();
        assert_eq!(metadata.get("original"), Some(&json!("not json")));
    }
}
