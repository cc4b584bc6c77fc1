//! In-process transport.
//!
//! `MemoryTransport` hands every accepted link to a `MemoryServer`, which
//! yields one `MemoryPeer` per connection. The peer plays the server side:
//! it reads what the client sent, pushes frames back, closes, fails or simply
//! drops the link. Connect outcomes can be scripted per attempt.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

use super::{CloseReason, Frame, Link, Transport, TransportError};
use crate::events::lock;
use crate::models::Payload;

/// What the next `open()` does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPlan {
    Accept,
    Refuse(String),
    /// Never completes; exercises connect timeouts and cancellation.
    Hang,
}

struct Shared {
    plans: VecDeque<ConnectPlan>,
    attempts: Vec<Url>,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

pub struct MemoryPeer {
    pub url: Url,
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Result<Frame, TransportError>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryServer) {
        let (accepted, peers) = mpsc::unbounded_channel();
        let transport = MemoryTransport {
            shared: Arc::new(Mutex::new(Shared {
                plans: VecDeque::new(),
                attempts: Vec::new(),
                accepted,
            })),
        };
        (transport, MemoryServer { peers })
    }

    /// Script the outcome of the next unscripted attempt. Unscripted attempts accept.
    pub fn plan(&self, plan: ConnectPlan) {
        lock(&self.shared).plans.push_back(plan);
    }

    pub fn refuse_next(&self, reason: &str) {
        self.plan(ConnectPlan::Refuse(reason.to_string()));
    }

    pub fn hang_next(&self) {
        self.plan(ConnectPlan::Hang);
    }

    /// Every URL `open()` was called with, oldest first.
    pub fn attempts(&self) -> Vec<Url> {
        lock(&self.shared).attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        lock(&self.shared).attempts.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &Url) -> Result<Link, TransportError> {
        let (plan, accepted) = {
            let mut shared = lock(&self.shared);
            shared.attempts.push(url.clone());
            let plan = shared.plans.pop_front().unwrap_or(ConnectPlan::Accept);
            (plan, shared.accepted.clone())
        };

        match plan {
            ConnectPlan::Refuse(reason) => Err(TransportError::Refused(reason)),
            ConnectPlan::Hang => std::future::pending::<Result<Link, TransportError>>().await,
            ConnectPlan::Accept => {
                let (client_tx, server_rx) = mpsc::unbounded_channel();
                let (server_tx, client_rx) = mpsc::unbounded_channel();
                let peer = MemoryPeer {
                    url: url.clone(),
                    incoming: server_rx,
                    outgoing: server_tx,
                };
                accepted
                    .send(peer)
                    .map_err(|_| TransportError::Refused("memory server is gone".to_string()))?;
                Ok(Link::new(client_tx, client_rx))
            }
        }
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

impl MemoryPeer {
    pub fn send(&self, payload: Payload) -> bool {
        self.outgoing.send(Ok(Frame::Data(payload))).is_ok()
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.send(Payload::Text(text.to_string()))
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(&value.to_string())
    }

    /// Send a close frame, as a server ending the session would.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.outgoing
            .send(Ok(Frame::Close(Some(CloseReason::new(code, reason)))))
            .is_ok()
    }

    /// Report a transport failure to the client.
    pub fn fail(&self, error: TransportError) -> bool {
        self.outgoing.send(Err(error)).is_ok()
    }

    /// Next frame the client sent, or `None` once the client dropped the link.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.incoming.try_recv().ok()
    }

    /// Next data frame decoded as JSON, skipping anything else.
    pub async fn recv_json(&mut self) -> Option<Value> {
        while let Some(frame) = self.recv().await {
            if let Frame::Data(payload) = frame {
                if let Ok(value) = serde_json::from_slice(payload.as_bytes()) {
                    return Some(value);
                }
            }
        }
        None
    }
}
