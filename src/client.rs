// Chat client
// Wires the connection, heartbeat, reconnector, queue and wire handling into one client

use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;

use crate::config::ClientConfig;
use crate::connection::{
    ConnectParams, ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionManager,
    HeartbeatEvent, HeartbeatMonitor, ReconnectError, ReconnectEvent, Reconnector,
};
use crate::events::{lock, EventBus, ListenerId, NamedEvent};
use crate::models::{CanonicalMessage, ConnectionId, ConnectionStatus, Payload, QueuedMessage};
use crate::queue::{FileStorage, MessageQueue, ProcessSummary, QueueStorage};
use crate::transport::{CloseReason, Transport, WebSocketTransport, HEARTBEAT_TIMEOUT};
use crate::wire::{is_heartbeat, MessageAdapter, Serializer, SerializerError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Serializer(#[from] SerializerError),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// What happened to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Not connected; the message waits in the queue under this id.
    Queued(String),
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// An inbound chat message, already normalized.
    Message(CanonicalMessage),
    QueueFlushed(ProcessSummary),
    /// The heartbeat monitor gave up on the connection.
    ConnectionDead { failed_count: u32 },
    /// Automatic reconnection stopped trying.
    ReconnectExhausted { attempts: u32 },
}

impl NamedEvent for ClientEvent {
    fn name(&self) -> &'static str {
        match self {
            ClientEvent::Message(_) => "message",
            ClientEvent::QueueFlushed(_) => "queueFlushed",
            ClientEvent::ConnectionDead { .. } => "connectionDead",
            ClientEvent::ReconnectExhausted { .. } => "reconnectExhausted",
        }
    }
}

#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    connection: ConnectionManager,
    heartbeat: HeartbeatMonitor,
    reconnector: Reconnector,
    queue: Arc<MessageQueue>,
    serializer: Serializer,
    adapter: MessageAdapter,
    events: EventBus<ClientEvent>,
    listeners: Mutex<Listeners>,
}

#[derive(Default)]
struct Listeners {
    connection: Vec<ListenerId>,
    heartbeat: Option<ListenerId>,
    reconnector: Option<ListenerId>,
}

impl ChatClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, storage: Arc<dyn QueueStorage>) -> Self {
        let connection = ConnectionManager::new(transport, config.connection.clone());
        let serializer = Serializer::new(config.serializer.clone());
        let heartbeat = HeartbeatMonitor::new(connection.clone(), config.heartbeat.clone(), serializer.clone());
        let reconnector = Reconnector::new(connection.clone(), config.reconnect.clone());
        let queue = Arc::new(MessageQueue::new(config.queue.clone(), storage));

        let inner = Arc::new(Inner {
            config,
            connection,
            heartbeat,
            reconnector,
            queue,
            serializer,
            adapter: MessageAdapter::new(),
            events: EventBus::new(),
            listeners: Mutex::new(Listeners::default()),
        });
        Inner::attach(&inner);

        ChatClient { inner }
    }

    /// A client speaking WebSocket, with its queue persisted to disk.
    pub fn websocket(config: ClientConfig) -> Result<Self> {
        let storage = match &config.queue.storage_dir {
            Some(dir) => FileStorage::new(dir.clone())?,
            None => FileStorage::default_location()?,
        };
        info!("Persisting offline queue in {}", storage.dir().display());
        Ok(Self::new(config, Arc::new(WebSocketTransport::new()), Arc::new(storage)))
    }

    pub fn events(&self) -> &EventBus<ClientEvent> {
        &self.inner.events
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.inner.heartbeat
    }

    pub fn reconnector(&self) -> &Reconnector {
        &self.inner.reconnector
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.inner.queue
    }

    pub fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    pub async fn connect(&self, endpoint: &str, params: &ConnectParams) -> Result<ConnectionHandle, ClientError> {
        Ok(self.inner.connection.connect(endpoint, params).await?)
    }

    /// Close the connection and stop background recovery until the next `connect`.
    pub fn close(&self) {
        self.inner.reconnector.cancel();
        self.inner.heartbeat.stop();
        self.inner.connection.close();
    }

    /// Send `message` now, or queue it for later when not connected.
    pub fn send(&self, message: &CanonicalMessage) -> Result<SendOutcome, ClientError> {
        let value = serde_json::to_value(message).map_err(SerializerError::Serialization)?;
        self.send_value(value, Some(&message.conversation_id))
    }

    /// Like `send`, for an arbitrary JSON message.
    ///
    /// While older messages are still queued the new one is queued behind
    /// them and a flush is started, so delivery order matches send order.
    pub fn send_value(&self, value: Value, conversation_id: Option<&str>) -> Result<SendOutcome, ClientError> {
        let inner = &self.inner;
        let payload = inner.serializer.serialize(&value)?;

        let connected = inner.connection.is_connected();
        let backlog = !inner.queue.is_empty() || inner.queue.is_processing();
        if connected && !backlog && inner.connection.send(payload) {
            return Ok(SendOutcome::Sent);
        }

        let entry = inner.queue.enqueue(value, conversation_id);
        if connected && backlog {
            debug!("Message {} queued behind {} older message(s)", entry.id, inner.queue.len() - 1);
            spawn_flush(Arc::downgrade(inner));
        } else {
            debug!("Message {} queued until the connection is back", entry.id);
        }
        Ok(SendOutcome::Queued(entry.id))
    }

    /// Deliver queued messages over the current connection.
    pub async fn flush_queue(&self) -> Option<ProcessSummary> {
        self.inner.flush(None).await
    }

    /// Deliver only the queued messages of one conversation.
    pub async fn flush_conversation(&self, conversation_id: &str) -> Option<ProcessSummary> {
        self.inner.flush(Some(conversation_id)).await
    }
}

impl Inner {
    fn attach(this: &Arc<Self>) {
        let mut listeners = Listeners::default();

        let weak = Arc::downgrade(this);
        listeners.connection.push(this.connection.events().on("message", move |event| {
            if let (Some(inner), ConnectionEvent::Message { connection_id, payload }) = (weak.upgrade(), event) {
                inner.handle_inbound(*connection_id, payload);
            }
        }));

        let weak = Arc::downgrade(this);
        listeners.connection.push(this.connection.events().on("open", move |_| {
            spawn_flush(weak.clone());
        }));

        let weak = Arc::downgrade(this);
        listeners.heartbeat = Some(this.heartbeat.events().on("dead", move |event| {
            if let (Some(inner), HeartbeatEvent::Dead { failed_count, .. }) = (weak.upgrade(), event) {
                inner.handle_dead(*failed_count);
            }
        }));

        let weak = Arc::downgrade(this);
        listeners.reconnector = Some(this.reconnector.events().on("maxAttemptsReached", move |event| {
            if let (Some(inner), ReconnectEvent::MaxAttemptsReached { attempts }) = (weak.upgrade(), event) {
                error!("Automatic reconnection exhausted after {} attempts", attempts);
                inner.events.emit(ClientEvent::ReconnectExhausted { attempts: *attempts });
            }
        }));

        *lock(&this.listeners) = listeners;
    }

    fn handle_inbound(&self, connection_id: ConnectionId, payload: &Payload) {
        let message = match self.serializer.decode(payload) {
            Ok(value) if is_heartbeat(&value) => return,
            Ok(value) => self.adapter.adapt(&value),
            Err(e) => {
                warn!("{} sent an undecodable frame: {}", connection_id, e);
                self.adapter.adapt_payload(payload)
            }
        };
        self.events.emit(ClientEvent::Message(message));
    }

    fn handle_dead(&self, failed_count: u32) {
        if self.config.heartbeat.close_on_dead {
            warn!("Closing connection after {} missed heartbeats", failed_count);
            self.connection
                .close_with(CloseReason::new(HEARTBEAT_TIMEOUT, "heartbeat timeout"));
        }
        self.events.emit(ClientEvent::ConnectionDead { failed_count });
    }

    async fn flush(&self, conversation_id: Option<&str>) -> Option<ProcessSummary> {
        if self.queue.is_empty() {
            return None;
        }

        let deliver = |entry: QueuedMessage| std::future::ready(self.deliver(&entry));
        let summary = match conversation_id {
            Some(conversation_id) => {
                let conversation_id = conversation_id.to_string();
                let filter = move |m: &QueuedMessage| m.conversation_id.as_deref() == Some(conversation_id.as_str());
                self.queue.process_queue(deliver, Some(&filter)).await
            }
            None => self.queue.process_queue(deliver, None).await,
        }?;

        self.events.emit(ClientEvent::QueueFlushed(summary));
        Some(summary)
    }

    fn deliver(&self, entry: &QueuedMessage) -> bool {
        if !self.connection.is_connected() {
            return false;
        }
        match self.serializer.serialize(&entry.message) {
            Ok(payload) => self.connection.send(payload),
            Err(e) => {
                warn!("Queued message {} can no longer be encoded: {}", entry.id, e);
                false
            }
        }
    }
}

/// Replay the queue in the background. Passes repeat while they make progress
/// and messages queued during a pass are still waiting.
fn spawn_flush(inner: Weak<Inner>) {
    tokio::spawn(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        while let Some(summary) = inner.flush(None).await {
            debug!("Flushed queue: {:?}", summary);
            if summary.failed > 0 || inner.queue.is_empty() || !inner.connection.is_connected() {
                break;
            }
        }
    });
}

impl Drop for Inner {
    fn drop(&mut self) {
        let listeners = std::mem::take(self.listeners.get_mut().unwrap_or_else(|p| p.into_inner()));
        for id in listeners.connection {
            self.connection.events().off(id);
        }
        if let Some(id) = listeners.heartbeat {
            self.heartbeat.events().off(id);
        }
        if let Some(id) = listeners.reconnector {
            self.reconnector.events().off(id);
        }
    }
}
