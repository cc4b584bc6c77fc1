// Core data model shared by every chatwire component

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Status of the single logical connection owned by a `ConnectionManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Identifies one `connect()` lifecycle. Zero means "never connected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Voice,
    System,
    Connect,
    Heartbeat,
    Command,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Voice => "voice",
            MessageType::System => "system",
            MessageType::Connect => "connect",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Command => "command",
        }
    }

    /// Parses the exact wire spelling. Synonyms are the adapter's business.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "voice" => Some(MessageType::Voice),
            "system" => Some(MessageType::System),
            "connect" => Some(MessageType::Connect),
            "heartbeat" => Some(MessageType::Heartbeat),
            "command" => Some(MessageType::Command),
            _ => None,
        }
    }

    /// Control frames carry a reduced payload and skip full validation.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageType::Heartbeat | MessageType::Connect | MessageType::Command
        )
    }

    pub fn is_content(&self) -> bool {
        matches!(self, MessageType::Text | MessageType::Image | MessageType::Voice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderType {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "customer")]
    Customer,
    #[serde(rename = "consultant")]
    Consultant,
    #[serde(rename = "doctor")]
    Doctor,
    #[serde(rename = "ai")]
    AI,
    #[serde(rename = "system")]
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Customer => "customer",
            SenderType::Consultant => "consultant",
            SenderType::Doctor => "doctor",
            SenderType::AI => "ai",
            SenderType::System => "system",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "user" => Some(SenderType::User),
            "customer" => Some(SenderType::Customer),
            "consultant" => Some(SenderType::Consultant),
            "doctor" => Some(SenderType::Doctor),
            "ai" => Some(SenderType::AI),
            "system" => Some(SenderType::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(rename = "type")]
    pub sender_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Sender {
    pub const SYSTEM_ID: &'static str = "system";

    pub fn new(id: impl Into<String>, sender_type: SenderType) -> Self {
        Sender {
            id: id.into(),
            sender_type,
            name: None,
            avatar: None,
        }
    }

    /// The canonical identity used when a payload has no sender at all.
    pub fn system() -> Self {
        Sender::new(Self::SYSTEM_ID, SenderType::System)
    }
}

/// The normalized message every consumer receives.
///
/// Serialized as the flat snake_case wire envelope; camelCase spellings are
/// accepted when reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub id: String,
    #[serde(alias = "conversationId")]
    pub conversation_id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender: Sender,
    pub timestamp: String,
    #[serde(default, alias = "isImportant", skip_serializing_if = "Option::is_none")]
    pub is_important: Option<bool>,
    #[serde(
        default,
        alias = "isSystemMessage",
        skip_serializing_if = "Option::is_none"
    )]
    pub is_system_message: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl CanonicalMessage {
    /// Creates a message stamped with a fresh id and the current time.
    pub fn new(
        conversation_id: impl Into<String>,
        message_type: MessageType,
        sender: Sender,
        content: Value,
    ) -> Self {
        CanonicalMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            content,
            message_type,
            sender,
            timestamp: now_timestamp(),
            is_important: None,
            is_system_message: None,
            metadata: None,
        }
    }

    pub fn text(conversation_id: impl Into<String>, sender: Sender, text: &str) -> Self {
        Self::new(
            conversation_id,
            MessageType::Text,
            sender,
            Value::String(text.to_string()),
        )
    }

    /// Content rendered for display: strings as-is, anything else as JSON.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// An outbound message waiting for a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub message: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// A data payload as carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Binary(b) => b,
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Binary(b)
    }
}

/// ISO-8601 timestamp with millisecond precision, UTC.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
