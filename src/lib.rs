// Re-export modules for the binary and the integration tests
pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod models;
pub mod queue;
pub mod transport;
pub mod wire;

// Re-export main types for convenience
pub use client::{ChatClient, ClientError, ClientEvent, SendOutcome};
pub use config::ClientConfig;
pub use connection::{ConnectionError, ConnectionEvent, ConnectionManager, HeartbeatMonitor, Reconnector};
pub use events::{EventBus, ListenerId, NamedEvent};
pub use models::*;
pub use queue::MessageQueue;
pub use wire::{MessageAdapter, Serializer};
