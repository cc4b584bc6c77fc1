// Common test utilities for integration tests
// This module contains shared code for all integration tests
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use log::LevelFilter;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use chatwire::{
    config::ClientConfig,
    connection::ConnectionManager,
    queue::{MemoryStorage, QueueStorage},
    transport::{MemoryPeer, MemoryServer, MemoryTransport},
    ChatClient,
};

pub const ENDPOINT: &str = "ws://chat.test/socket";

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Short, deterministic timings: no jitter, heartbeat timer effectively off.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connection.connect_timeout_ms = 1_000;
    config.heartbeat.interval_ms = 3_600_000;
    config.heartbeat.max_failures = 3;
    config.reconnect.base_delay_ms = 100;
    config.reconnect.max_delay_ms = 1_000;
    config.reconnect.jitter_factor = 0.0;
    config.reconnect.max_attempts = 5;
    config
}

pub fn memory_manager(config: &ClientConfig) -> (ConnectionManager, MemoryTransport, MemoryServer) {
    let (transport, server) = MemoryTransport::new();
    let manager = ConnectionManager::new(Arc::new(transport.clone()), config.connection.clone());
    (manager, transport, server)
}

pub fn memory_client(config: ClientConfig) -> (ChatClient, MemoryTransport, MemoryServer) {
    memory_client_with_storage(config, Arc::new(MemoryStorage::new()))
}

pub fn memory_client_with_storage(
    config: ClientConfig,
    storage: Arc<dyn QueueStorage>,
) -> (ChatClient, MemoryTransport, MemoryServer) {
    let (transport, server) = MemoryTransport::new();
    let client = ChatClient::new(config, Arc::new(transport.clone()), storage);
    (client, transport, server)
}

/// The server side of the next accepted connection.
pub async fn accept(server: &mut MemoryServer) -> MemoryPeer {
    timeout(EVENT_TIMEOUT, server.accept())
        .await
        .expect("timed out waiting for a connection")
        .expect("memory transport dropped")
}

/// Wait for the first event matching `pred`, discarding the others.
pub async fn next_event<E, F>(rx: &mut UnboundedReceiver<E>, mut pred: F) -> E
where
    F: FnMut(&E) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Every event up to and including the first one matching `pred`.
pub async fn events_until<E, F>(rx: &mut UnboundedReceiver<E>, mut pred: F) -> Vec<E>
where
    F: FnMut(&E) -> bool,
{
    let mut seen = Vec::new();
    timeout(EVENT_TIMEOUT, async {
        while let Some(event) = rx.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return;
            }
        }
        panic!("event stream closed");
    })
    .await
    .expect("timed out waiting for event");
    seen
}

/// Everything already delivered to `rx`.
pub fn drain<E>(rx: &mut UnboundedReceiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
