// Transport layer for chatwire
// A transport opens one physical link to a server and exposes it as a pair of channels

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::models::Payload;

pub mod memory;
pub mod websocket;

pub use memory::{ConnectPlan, MemoryPeer, MemoryServer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Close code for a negotiated, intentional closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when no close frame was received.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported when the peer sent a close frame without a status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code the client uses when the heartbeat monitor gave up on a link.
pub const HEARTBEAT_TIMEOUT: u16 = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        CloseReason {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        CloseReason::new(NORMAL_CLOSURE, "normal closure")
    }

    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// A unit exchanged with the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Payload),
    Close(Option<CloseReason>),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection reset: {0}")]
    Reset(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::Refused(e.to_string()),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                TransportError::Reset(e.to_string())
            }
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// An open link: frames to send go into `outbound`, frames received come out of `inbound`.
///
/// Dropping `outbound` ends the write side. Background pump tasks owned by the
/// link are aborted when the link guard is dropped.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    pumps: LinkGuard,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    ) -> Self {
        Link {
            outbound,
            inbound,
            pumps: LinkGuard::default(),
        }
    }

    pub fn with_pumps(mut self, pumps: Vec<JoinHandle<()>>) -> Self {
        self.pumps = LinkGuard(pumps);
        self
    }

    /// Split into parts; the guard keeps the pumps alive until dropped.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Frame>,
        mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
        LinkGuard,
    ) {
        (self.outbound, self.inbound, self.pumps)
    }
}

/// Aborts the link's pump tasks on drop.
#[derive(Default)]
pub struct LinkGuard(Vec<JoinHandle<()>>);

impl Drop for LinkGuard {
    fn drop(&mut self) {
        for pump in self.0.drain(..) {
            pump.abort();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link to `url`. Must not apply its own timeout.
    async fn open(&self, url: &Url) -> Result<Link, TransportError>;
}
