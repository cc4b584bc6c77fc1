// Offline message queue
// Buffers outbound messages while disconnected and replays them in order once delivery is possible

use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::QueueConfig;
use crate::events::{lock, EventBus, NamedEvent};
use crate::models::QueuedMessage;

pub mod storage;

pub use storage::{FileStorage, MemoryStorage, QueueStorage};

/// Selects which entries a `process_queue` pass delivers.
pub type QueueFilter = dyn Fn(&QueuedMessage) -> bool + Send + Sync;

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued(QueuedMessage),
    Dequeued { id: String },
    /// The oldest entry was evicted to make room.
    Overflow { dropped: QueuedMessage },
    Retry { id: String, retry_count: u32 },
    ProcessComplete(ProcessSummary),
    Cleared { removed: usize, conversation_id: Option<String> },
}

impl NamedEvent for QueueEvent {
    fn name(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued(_) => "enqueue",
            QueueEvent::Dequeued { .. } => "dequeue",
            QueueEvent::Overflow { .. } => "overflow",
            QueueEvent::Retry { .. } => "retry",
            QueueEvent::ProcessComplete(_) => "processComplete",
            QueueEvent::Cleared { .. } => "cleared",
        }
    }
}

/// Outcome of one `process_queue` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub delivered: usize,
    pub failed: usize,
    /// Entries removed by someone else while the pass was running.
    pub skipped: usize,
    pub remaining: usize,
}

pub struct MessageQueue {
    config: QueueConfig,
    storage: Arc<dyn QueueStorage>,
    buffer: Mutex<VecDeque<QueuedMessage>>,
    processing: AtomicBool,
    events: EventBus<QueueEvent>,
}

/// Clears the single-flight flag when a pass ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MessageQueue {
    /// Create a queue, restoring whatever `storage` holds under the configured key.
    pub fn new(config: QueueConfig, storage: Arc<dyn QueueStorage>) -> Self {
        let buffer = load_buffer(&config, storage.as_ref());
        if !buffer.is_empty() {
            info!("Restored {} queued messages", buffer.len());
        }

        MessageQueue {
            config,
            storage,
            buffer: Mutex::new(buffer),
            processing: AtomicBool::new(false),
            events: EventBus::new(),
        }
    }

    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(config, Arc::new(MemoryStorage::new()))
    }

    pub fn events(&self) -> &EventBus<QueueEvent> {
        &self.events
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn capacity(&self) -> usize {
        self.config.max_queue_size.max(1)
    }

    /// Append `message`, evicting the oldest entries when the queue is full.
    ///
    /// The message's own string `id` is reused when it has one. Without an
    /// explicit `conversation_id`, the message's own conversation id is used.
    pub fn enqueue(&self, message: Value, conversation_id: Option<&str>) -> QueuedMessage {
        let id = message
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let conversation_id = conversation_id.map(str::to_string).or_else(|| {
            message
                .get("conversation_id")
                .or_else(|| message.get("conversationId"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let entry = QueuedMessage {
            id,
            message,
            enqueued_at: chrono::Utc::now(),
            retry_count: 0,
            conversation_id,
        };

        let mut buffer = lock(&self.buffer);
        while buffer.len() >= self.capacity() {
            if let Some(dropped) = buffer.pop_front() {
                warn!("Queue full ({} entries), dropping oldest message {}", self.capacity(), dropped.id);
                self.events.enqueue(QueueEvent::Overflow { dropped });
            }
        }
        buffer.push_back(entry.clone());
        self.persist(&buffer);
        debug!("Queued message {} ({} waiting)", entry.id, buffer.len());
        self.events.enqueue(QueueEvent::Enqueued(entry.clone()));
        drop(buffer);

        self.events.drain();
        entry
    }

    /// Remove the entry with `id`. Returns whether it was queued.
    pub fn dequeue(&self, id: &str) -> bool {
        let mut buffer = lock(&self.buffer);
        let Some(index) = buffer.iter().position(|m| m.id == id) else {
            return false;
        };
        buffer.remove(index);
        self.persist(&buffer);
        self.events.enqueue(QueueEvent::Dequeued { id: id.to_string() });
        drop(buffer);

        self.events.drain();
        true
    }

    pub fn remove_conversation_messages(&self, conversation_id: &str) -> usize {
        let mut buffer = lock(&self.buffer);
        let before = buffer.len();
        buffer.retain(|m| m.conversation_id.as_deref() != Some(conversation_id));
        let removed = before - buffer.len();
        if removed > 0 {
            self.persist(&buffer);
            self.events.enqueue(QueueEvent::Cleared {
                removed,
                conversation_id: Some(conversation_id.to_string()),
            });
        }
        drop(buffer);

        self.events.drain();
        removed
    }

    pub fn clear(&self) -> usize {
        let mut buffer = lock(&self.buffer);
        let removed = buffer.len();
        buffer.clear();
        self.persist(&buffer);
        self.events.enqueue(QueueEvent::Cleared {
            removed,
            conversation_id: None,
        });
        drop(buffer);

        self.events.drain();
        removed
    }

    pub fn messages(&self) -> Vec<QueuedMessage> {
        lock(&self.buffer).iter().cloned().collect()
    }

    pub fn conversation_messages(&self, conversation_id: &str) -> Vec<QueuedMessage> {
        lock(&self.buffer)
            .iter()
            .filter(|m| m.conversation_id.as_deref() == Some(conversation_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.buffer).is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Try to deliver every queued entry (or those matching `filter`), oldest first.
    ///
    /// Each delivery is awaited before the next starts. Delivered entries are
    /// removed; failed ones stay queued with their retry count bumped. Returns
    /// `None` without doing anything if another pass is already running.
    pub async fn process_queue<F, Fut>(
        &self,
        mut deliver: F,
        filter: Option<&QueueFilter>,
    ) -> Option<ProcessSummary>
    where
        F: FnMut(QueuedMessage) -> Fut,
        Fut: Future<Output = bool>,
    {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Queue processing already in progress");
            return None;
        }
        let _guard = ProcessingGuard(&self.processing);

        let snapshot: Vec<QueuedMessage> = lock(&self.buffer)
            .iter()
            .filter(|m| filter.map_or(true, |f| f(m)))
            .cloned()
            .collect();

        let mut summary = ProcessSummary::default();
        for entry in snapshot {
            let id = entry.id.clone();
            if !lock(&self.buffer).iter().any(|m| m.id == id) {
                summary.skipped += 1;
                continue;
            }

            if deliver(entry).await {
                self.dequeue(&id);
                summary.delivered += 1;
            } else {
                self.mark_retry(&id);
                summary.failed += 1;
            }
        }

        summary.remaining = self.len();
        if summary.delivered + summary.failed > 0 {
            info!(
                "Queue pass finished: {} delivered, {} failed, {} remaining",
                summary.delivered, summary.failed, summary.remaining
            );
        }
        self.events.emit(QueueEvent::ProcessComplete(summary));
        Some(summary)
    }

    fn mark_retry(&self, id: &str) {
        let mut buffer = lock(&self.buffer);
        let Some(entry) = buffer.iter_mut().find(|m| m.id == id) else {
            return;
        };
        entry.retry_count += 1;
        let retry_count = entry.retry_count;
        self.persist(&buffer);
        self.events.enqueue(QueueEvent::Retry {
            id: id.to_string(),
            retry_count,
        });
        drop(buffer);

        self.events.drain();
    }

    /// Write the buffer to storage. Failures are logged; the in-memory queue stays authoritative.
    fn persist(&self, buffer: &VecDeque<QueuedMessage>) {
        let result = serde_json::to_string(buffer)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.storage.set(&self.config.storage_key, &json));
        if let Err(e) = result {
            error!("Failed to persist message queue: {}", e);
        }
    }
}

fn load_buffer(config: &QueueConfig, storage: &dyn QueueStorage) -> VecDeque<QueuedMessage> {
    let stored = match storage.get(&config.storage_key) {
        Ok(Some(stored)) => stored,
        Ok(None) => return VecDeque::new(),
        Err(e) => {
            warn!("Could not read persisted queue, starting empty: {}", e);
            return VecDeque::new();
        }
    };

    match serde_json::from_str::<Vec<QueuedMessage>>(&stored) {
        Ok(entries) => {
            let capacity = config.max_queue_size.max(1);
            let skip = entries.len().saturating_sub(capacity);
            entries.into_iter().skip(skip).collect()
        }
        Err(e) => {
            warn!("Persisted queue is not valid, starting empty: {}", e);
            VecDeque::new()
        }
    }
}
