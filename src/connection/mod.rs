//! Connection management.
//!
//! A `ConnectionManager` owns at most one live link. Every `connect()` starts
//! a new lifecycle with its own `ConnectionId`; events from a superseded
//! lifecycle are dropped, so observers only ever see status change, open,
//! messages and close for the current one, in that order.
//!
//! The heartbeat monitor and the reconnector in the submodules never touch
//! link state directly. They observe events and act through `connect`,
//! `send` and `close` like any other caller.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::ConnectionConfig;
use crate::events::{lock, EventBus, NamedEvent};
use crate::models::{ConnectionId, ConnectionStatus, Payload};
use crate::transport::{
    CloseReason, Frame, Link, LinkGuard, Transport, TransportError, ABNORMAL_CLOSURE, NO_STATUS_RECEIVED,
    NORMAL_CLOSURE,
};

pub mod heartbeat;
pub mod reconnect;

pub use heartbeat::{HeartbeatEvent, HeartbeatMonitor};
pub use reconnect::{backoff_delay, ReconnectError, ReconnectEvent, Reconnector};

/// Query parameters appended to the endpoint URL.
pub type ConnectParams = BTreeMap<String, String>;

/// How long a replaced link may keep flushing its close frame before its pumps are aborted.
const LINK_LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection attempt was cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// Whether retrying the same endpoint could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Transport(_) | ConnectionError::ConnectTimeout(_)
        )
    }
}

/// What an `error` event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The link failed; the connection is gone.
    Transport,
    /// `send` was called while not connected.
    NotConnected,
    /// The link refused an outbound frame.
    SendFailed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StatusChange {
        connection_id: ConnectionId,
        previous: ConnectionStatus,
        status: ConnectionStatus,
    },
    Open {
        connection_id: ConnectionId,
    },
    Message {
        connection_id: ConnectionId,
        payload: Payload,
    },
    Close {
        connection_id: ConnectionId,
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error {
        connection_id: ConnectionId,
        kind: ErrorKind,
        message: String,
    },
    Timeout {
        connection_id: ConnectionId,
        after: Duration,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::StatusChange { connection_id, .. }
            | ConnectionEvent::Open { connection_id }
            | ConnectionEvent::Message { connection_id, .. }
            | ConnectionEvent::Close { connection_id, .. }
            | ConnectionEvent::Error { connection_id, .. }
            | ConnectionEvent::Timeout { connection_id, .. } => *connection_id,
        }
    }
}

impl NamedEvent for ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::StatusChange { .. } => "statusChange",
            ConnectionEvent::Open { .. } => "open",
            ConnectionEvent::Message { .. } => "message",
            ConnectionEvent::Close { .. } => "close",
            ConnectionEvent::Error { .. } => "error",
            ConnectionEvent::Timeout { .. } => "timeout",
        }
    }
}

/// Endpoint and parameters of the most recent `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub endpoint: String,
    pub params: ConnectParams,
}

/// Returned by a successful `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub url: Url,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    state: Mutex<ConnState>,
    events: EventBus<ConnectionEvent>,
    next_id: AtomicU64,
}

struct ConnState {
    status: ConnectionStatus,
    /// Lifecycle that is connecting or connected, if any.
    current: Option<ConnectionId>,
    /// Most recent lifecycle, reported on events even after it ended.
    last_id: ConnectionId,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    cancel: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    link: Option<LinkGuard>,
    target: Option<ConnectTarget>,
}

impl ConnState {
    fn set_status(&mut self, status: ConnectionStatus, events: &EventBus<ConnectionEvent>) {
        if self.status == status {
            return;
        }
        let previous = self.status;
        self.status = status;
        debug!("{} status {} -> {}", self.last_id, previous, status);
        events.enqueue(ConnectionEvent::StatusChange {
            connection_id: self.last_id,
            previous,
            status,
        });
    }
}

enum Ending {
    Closed(Option<CloseReason>),
    Failed(TransportError),
    Dropped,
}

enum Failure {
    Transport(TransportError),
    Timeout,
    Cancelled,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                transport,
                config,
                state: Mutex::new(ConnState {
                    status: ConnectionStatus::Disconnected,
                    current: None,
                    last_id: ConnectionId::default(),
                    outbound: None,
                    cancel: None,
                    reader: None,
                    link: None,
                    target: None,
                }),
                events: EventBus::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn events(&self) -> &EventBus<ConnectionEvent> {
        &self.inner.events
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Id of the lifecycle that is connecting or connected.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.inner.state).current
    }

    pub fn target(&self) -> Option<ConnectTarget> {
        lock(&self.inner.state).target.clone()
    }

    /// Open a connection to `endpoint`, replacing any existing one.
    ///
    /// The endpoint is validated before any I/O. Resolves once the link is
    /// open, fails, times out, or is cancelled by `close()` or a newer
    /// `connect()`.
    pub async fn connect(
        &self,
        endpoint: &str,
        params: &ConnectParams,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let url = build_url(endpoint, params)?;
        let inner = &self.inner;

        self.close_with(CloseReason::new(NORMAL_CLOSURE, "superseded by a new connection"));

        let id = ConnectionId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        {
            let mut state = lock(&inner.state);
            state.current = Some(id);
            state.last_id = id;
            state.cancel = Some(cancel_tx);
            state.target = Some(ConnectTarget {
                endpoint: endpoint.to_string(),
                params: params.clone(),
            });
            state.set_status(ConnectionStatus::Connecting, &inner.events);
        }
        inner.events.drain();
        info!("{} connecting to {}", id, redacted(&url));

        let connect_timeout = inner.config.connect_timeout();
        let outcome = tokio::select! {
            opened = tokio::time::timeout(connect_timeout, inner.transport.open(&url)) => match opened {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(e)) => Err(Failure::Transport(e)),
                Err(_) => Err(Failure::Timeout),
            },
            _ = cancel_rx => Err(Failure::Cancelled),
        };

        match outcome {
            Ok(link) => inner.establish(id, url, link),
            Err(Failure::Cancelled) => {
                debug!("{} connect cancelled", id);
                Err(ConnectionError::Cancelled)
            }
            Err(Failure::Transport(e)) => {
                error!("{} failed to connect: {}", id, e);
                inner.fail_attempt(
                    id,
                    ConnectionEvent::Error {
                        connection_id: id,
                        kind: ErrorKind::Transport,
                        message: e.to_string(),
                    },
                )?;
                Err(ConnectionError::Transport(e))
            }
            Err(Failure::Timeout) => {
                warn!("{} did not open within {:?}", id, connect_timeout);
                inner.fail_attempt(
                    id,
                    ConnectionEvent::Timeout {
                        connection_id: id,
                        after: connect_timeout,
                    },
                )?;
                Err(ConnectionError::ConnectTimeout(connect_timeout))
            }
        }
    }

    /// Send a payload on the open link.
    ///
    /// Returns false and emits an `error` event when not connected or when
    /// the link no longer accepts frames.
    pub fn send(&self, data: impl Into<Payload>) -> bool {
        let payload = data.into();
        let inner = &self.inner;
        let state = lock(&inner.state);
        let id = state.last_id;

        let sent = match (&state.outbound, state.status) {
            (Some(outbound), ConnectionStatus::Connected) => {
                if outbound.send(Frame::Data(payload)).is_ok() {
                    true
                } else {
                    inner.events.enqueue(ConnectionEvent::Error {
                        connection_id: id,
                        kind: ErrorKind::SendFailed,
                        message: "link no longer accepts frames".to_string(),
                    });
                    false
                }
            }
            (_, status) => {
                debug!("{} dropping send while {}", id, status);
                inner.events.enqueue(ConnectionEvent::Error {
                    connection_id: id,
                    kind: ErrorKind::NotConnected,
                    message: format!("cannot send while {}", status),
                });
                false
            }
        };
        drop(state);

        inner.events.drain();
        sent
    }

    /// Close with a normal closure. Safe to call in any state.
    pub fn close(&self) {
        self.close_with(CloseReason::normal());
    }

    /// Close with an explicit code. Idempotent; a pending `connect()` resolves as cancelled.
    pub fn close_with(&self, reason: CloseReason) {
        let inner = &self.inner;
        let mut state = lock(&inner.state);

        let current = state.current.take();
        let was_active = matches!(
            state.status,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        );
        state.cancel = None;
        if let Some(outbound) = state.outbound.take() {
            let _ = outbound.send(Frame::Close(Some(reason.clone())));
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        let link = state.link.take();

        state.set_status(ConnectionStatus::Disconnected, &inner.events);
        if let (Some(id), true) = (current, was_active) {
            info!("{} closed locally ({} {})", id, reason.code, reason.reason);
            inner.events.enqueue(ConnectionEvent::Close {
                connection_id: id,
                code: reason.code,
                reason: reason.reason,
                was_clean: true,
            });
        }
        drop(state);

        if let Some(link) = link {
            release_link(link);
        }
        inner.events.drain();
    }
}

impl Inner {
    fn establish(
        self: &Arc<Self>,
        id: ConnectionId,
        url: Url,
        link: Link,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let (outbound, inbound, guard) = link.into_parts();
        {
            let mut state = lock(&self.state);
            if state.current != Some(id) {
                debug!("{} opened after being superseded, discarding", id);
                return Err(ConnectionError::Cancelled);
            }
            state.cancel = None;
            state.outbound = Some(outbound);
            state.link = Some(guard);
            // The reader needs this lock to deliver, so no message can precede `open`
            state.reader = Some(tokio::spawn(read_loop(Arc::downgrade(self), id, inbound)));
            state.set_status(ConnectionStatus::Connected, &self.events);
            self.events.enqueue(ConnectionEvent::Open { connection_id: id });
        }
        info!("{} open", id);
        self.events.drain();
        Ok(ConnectionHandle { id, url })
    }

    /// Mark a failed attempt, unless it was superseded meanwhile.
    fn fail_attempt(&self, id: ConnectionId, event: ConnectionEvent) -> Result<(), ConnectionError> {
        {
            let mut state = lock(&self.state);
            if state.current != Some(id) {
                return Err(ConnectionError::Cancelled);
            }
            state.current = None;
            state.cancel = None;
            state.set_status(ConnectionStatus::Error, &self.events);
            self.events.enqueue(event);
        }
        self.events.drain();
        Ok(())
    }

    /// Forward an inbound payload. Returns false once `id` is no longer current.
    fn deliver(&self, id: ConnectionId, payload: Payload) -> bool {
        {
            let state = lock(&self.state);
            if state.current != Some(id) || state.status != ConnectionStatus::Connected {
                return false;
            }
            self.events.enqueue(ConnectionEvent::Message {
                connection_id: id,
                payload,
            });
        }
        self.events.drain();
        true
    }

    /// The link ended on its own: remote close, failure, or a dropped stream.
    fn finish(&self, id: ConnectionId, ending: Ending) {
        let mut state = lock(&self.state);
        if state.current != Some(id) {
            return;
        }
        state.current = None;
        state.outbound = None;
        // Detach rather than abort: this runs on the reader task itself
        state.reader = None;
        let link = state.link.take();

        match ending {
            Ending::Closed(reason) => {
                let (code, reason) = reason
                    .map(|r| (r.code, r.reason))
                    .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                info!("{} closed by peer ({} {})", id, code, reason);
                state.set_status(ConnectionStatus::Disconnected, &self.events);
                self.events.enqueue(ConnectionEvent::Close {
                    connection_id: id,
                    code,
                    reason,
                    was_clean: true,
                });
            }
            Ending::Failed(e) => {
                error!("{} transport failure: {}", id, e);
                state.set_status(ConnectionStatus::Error, &self.events);
                self.events.enqueue(ConnectionEvent::Error {
                    connection_id: id,
                    kind: ErrorKind::Transport,
                    message: e.to_string(),
                });
                self.events.enqueue(ConnectionEvent::Close {
                    connection_id: id,
                    code: ABNORMAL_CLOSURE,
                    reason: e.to_string(),
                    was_clean: false,
                });
            }
            Ending::Dropped => {
                warn!("{} lost without a close frame", id);
                state.set_status(ConnectionStatus::Disconnected, &self.events);
                self.events.enqueue(ConnectionEvent::Close {
                    connection_id: id,
                    code: ABNORMAL_CLOSURE,
                    reason: "connection lost".to_string(),
                    was_clean: false,
                });
            }
        }
        drop(state);

        if let Some(link) = link {
            release_link(link);
        }
        self.events.drain();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        state.outbound = None;
        state.link = None;
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    id: ConnectionId,
    mut inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
) {
    let ending = loop {
        match inbound.recv().await {
            Some(Ok(Frame::Data(payload))) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if !inner.deliver(id, payload) {
                    return;
                }
            }
            Some(Ok(Frame::Close(reason))) => break Ending::Closed(reason),
            Some(Err(e)) => break Ending::Failed(e),
            None => break Ending::Dropped,
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.finish(id, ending);
    }
}

/// Let the link flush a pending close frame, then stop its pumps.
fn release_link(link: LinkGuard) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(LINK_LINGER).await;
                drop(link);
            });
        }
        Err(_) => drop(link),
    }
}

/// Validate `endpoint` and append `params` as query pairs.
pub fn build_url(endpoint: &str, params: &ConnectParams) -> Result<Url, ConnectionError> {
    let invalid = |reason: String| ConnectionError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(invalid("endpoint is empty".to_string()));
    }

    let mut url = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// The URL without its query string, which may carry tokens.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_appends_params() {
        let mut params = ConnectParams::new();
        params.insert("token".to_string(), "a b".to_string());
        params.insert("conversation".to_string(), "c-1".to_string());

        let url = build_url("ws://chat.example.com/socket", &params).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://chat.example.com/socket?conversation=c-1&token=a+b"
        );
        assert_eq!(redacted(&url), "ws://chat.example.com/socket");
    }

    #[test]
    fn test_build_url_rejects_malformed_endpoints() {
        let params = ConnectParams::new();
        for endpoint in ["", "   ", "not a url", "http://example.com", "ws://"] {
            let err = build_url(endpoint, &params).unwrap_err();
            assert!(
                matches!(err, ConnectionError::InvalidEndpoint { .. }),
                "{:?} gave {:?}",
                endpoint,
                err
            );
            assert!(!err.is_recoverable());
        }
    }

    #[test]
    fn test_error_recoverability() {
        assert!(ConnectionError::Transport(TransportError::Refused("x".into())).is_recoverable());
        assert!(ConnectionError::ConnectTimeout(Duration::from_secs(1)).is_recoverable());
        assert!(!ConnectionError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_event_names() {
        let id = ConnectionId(1);
        assert_eq!(ConnectionEvent::Open { connection_id: id }.name(), "open");
        assert_eq!(
            ConnectionEvent::Timeout {
                connection_id: id,
                after: Duration::from_secs(1)
            }
            .name(),
            "timeout"
        );
        assert_eq!(
            ConnectionEvent::StatusChange {
                connection_id: id,
                previous: ConnectionStatus::Disconnected,
                status: ConnectionStatus::Connecting
            }
            .connection_id(),
            id
        );
    }
}
