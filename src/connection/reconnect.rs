//! Automatic reconnection with exponential backoff.
//!
//! The `Reconnector` watches a `ConnectionManager` and, after an unexpected
//! loss (any close other than a clean 1000, a transport error or a connect
//! timeout), schedules a new `connect()` to the last target. Each lifecycle
//! is handled at most once, so an `error` followed by a `close` of the same
//! connection schedules a single attempt. At most one attempt is pending or
//! in flight at a time.

use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::{ConnectionError, ConnectionEvent, ConnectionManager, ErrorKind};
use crate::config::ReconnectConfig;
use crate::events::{lock, EventBus, ListenerId, NamedEvent};
use crate::models::{ConnectionId, ConnectionStatus};
use crate::transport::NORMAL_CLOSURE;

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("No endpoint has been connected yet")]
    NoTarget,

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    Scheduled { attempt: u32, delay: Duration },
    Attempt { attempt: u32 },
    Failure { attempt: u32, error: String },
    MaxAttemptsReached { attempts: u32 },
    Reconnected {
        connection_id: ConnectionId,
        attempts: u32,
    },
}

impl NamedEvent for ReconnectEvent {
    fn name(&self) -> &'static str {
        match self {
            ReconnectEvent::Scheduled { .. } => "reconnectScheduled",
            ReconnectEvent::Attempt { .. } => "reconnectAttempt",
            ReconnectEvent::Failure { .. } => "reconnectFailure",
            ReconnectEvent::MaxAttemptsReached { .. } => "maxAttemptsReached",
            ReconnectEvent::Reconnected { .. } => "reconnected",
        }
    }
}

/// Delay before attempt number `attempts + 1`.
///
/// Exponential: `min(base * 2^attempts * (1 + jitter_factor * random), max)`;
/// otherwise a constant `base`. `random` is expected in `[0, 1)`.
pub fn backoff_delay(config: &ReconnectConfig, attempts: u32, random: f64) -> Duration {
    if !config.exponential_backoff {
        return Duration::from_millis(config.base_delay_ms);
    }

    let exponential = config.base_delay_ms.saturating_mul(1u64 << attempts.min(32)) as f64;
    let jitter = exponential * config.jitter_factor.clamp(0.0, 1.0) * random.clamp(0.0, 1.0);
    let delay = (exponential + jitter).min(config.max_delay_ms as f64);
    Duration::from_millis(delay.round() as u64)
}

#[derive(Clone)]
pub struct Reconnector {
    inner: Arc<Inner>,
}

struct Inner {
    connection: ConnectionManager,
    config: ReconnectConfig,
    state: Mutex<State>,
    events: EventBus<ReconnectEvent>,
    listener: Mutex<Option<ListenerId>>,
}

struct State {
    enabled: bool,
    attempts: u32,
    exhausted: bool,
    /// Last lifecycle a loss was handled for.
    handled: Option<ConnectionId>,
    /// Timer for the next attempt, tagged with its attempt number.
    pending: Option<(u32, JoinHandle<()>)>,
    in_flight: bool,
    /// A loss observed while an attempt was in flight, handled once it settles.
    deferred: Option<(ConnectionId, String)>,
}

impl State {
    fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Reconnector {
    pub fn new(connection: ConnectionManager, config: ReconnectConfig) -> Self {
        let inner = Arc::new(Inner {
            connection,
            state: Mutex::new(State {
                enabled: config.enabled,
                attempts: 0,
                exhausted: false,
                handled: None,
                pending: None,
                in_flight: false,
                deferred: None,
            }),
            config,
            events: EventBus::new(),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = inner.connection.events().on_any(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.observe(event);
            }
        });
        *lock(&inner.listener) = Some(id);

        Reconnector { inner }
    }

    pub fn events(&self) -> &EventBus<ReconnectEvent> {
        &self.inner.events
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    /// Attempts made since the last successful open.
    pub fn attempts(&self) -> u32 {
        lock(&self.inner.state).attempts
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.state).enabled
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.inner.state).pending.is_some()
    }

    pub fn enable(&self) {
        lock(&self.inner.state).enabled = true;
    }

    /// Stop scheduling and drop any pending attempt.
    pub fn disable(&self) {
        let mut state = lock(&self.inner.state);
        state.enabled = false;
        state.deferred = None;
        if state.cancel_pending() {
            debug!("Pending reconnect cancelled by disable()");
        }
    }

    /// Drop a pending attempt without changing anything else.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.inner.state);
        state.deferred = None;
        state.cancel_pending()
    }

    /// Forget past attempts, allowing scheduling again after `maxAttemptsReached`.
    pub fn reset(&self) {
        let mut state = lock(&self.inner.state);
        state.cancel_pending();
        state.attempts = 0;
        state.exhausted = false;
        state.handled = None;
        state.deferred = None;
    }

    /// Reconnect to the last target right away, cancelling any pending attempt.
    ///
    /// Does nothing when already connected or connecting.
    pub async fn reconnect_now(&self) -> Result<(), ReconnectError> {
        let inner = &self.inner;
        match inner.connection.status() {
            ConnectionStatus::Connected | ConnectionStatus::Connecting => return Ok(()),
            _ => {}
        }
        let target = inner.connection.target().ok_or(ReconnectError::NoTarget)?;

        let attempt = {
            let mut state = lock(&inner.state);
            state.cancel_pending();
            state.attempts += 1;
            state.in_flight = true;
            state.attempts
        };
        info!("Manual reconnect to {} (attempt {})", target.endpoint, attempt);
        inner.events.emit(ReconnectEvent::Attempt { attempt });

        let result = inner.connection.connect(&target.endpoint, &target.params).await;
        inner.settle(attempt, result.as_ref().err());
        result.map(|_| ()).map_err(ReconnectError::from)
    }
}

impl Inner {
    fn observe(self: &Arc<Self>, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Open { connection_id } => self.on_open(*connection_id),
            ConnectionEvent::Close {
                connection_id,
                code,
                was_clean,
                ..
            } => {
                if *code == NORMAL_CLOSURE && *was_clean {
                    lock(&self.state).handled = Some(*connection_id);
                } else {
                    self.schedule(*connection_id, format!("closed with code {}", code));
                }
            }
            ConnectionEvent::Error {
                connection_id,
                kind: ErrorKind::Transport,
                message,
            } => self.schedule(*connection_id, message.clone()),
            ConnectionEvent::Timeout { connection_id, after } => {
                self.schedule(*connection_id, format!("connect timed out after {:?}", after))
            }
            _ => {}
        }
    }

    fn on_open(&self, connection_id: ConnectionId) {
        {
            let mut state = lock(&self.state);
            let attempts = state.attempts;
            state.cancel_pending();
            state.attempts = 0;
            state.exhausted = false;
            state.handled = None;
            state.deferred = None;
            if attempts > 0 {
                info!("Reconnected as {} after {} attempt(s)", connection_id, attempts);
                self.events.enqueue(ReconnectEvent::Reconnected {
                    connection_id,
                    attempts,
                });
            }
        }
        self.events.drain();
    }

    fn schedule(self: &Arc<Self>, connection_id: ConnectionId, cause: String) {
        {
            let mut state = lock(&self.state);
            if !state.enabled || state.handled == Some(connection_id) {
                return;
            }
            if state.in_flight {
                state.deferred = Some((connection_id, cause));
                return;
            }
            state.handled = Some(connection_id);

            if self.connection.target().is_none() {
                warn!("Connection lost ({}) but there is no endpoint to reconnect to", cause);
                return;
            }

            if state.attempts >= self.config.max_attempts {
                if !state.exhausted {
                    state.exhausted = true;
                    error!("Giving up after {} reconnect attempts", state.attempts);
                    self.events.enqueue(ReconnectEvent::MaxAttemptsReached {
                        attempts: state.attempts,
                    });
                }
            } else {
                let delay = backoff_delay(&self.config, state.attempts, rand::random::<f64>());
                state.attempts += 1;
                let attempt = state.attempts;
                state.cancel_pending();

                let weak = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.run_attempt(attempt).await;
                    }
                });
                state.pending = Some((attempt, handle));

                info!(
                    "{} lost ({}), reconnecting in {:?} (attempt {}/{})",
                    connection_id, cause, delay, attempt, self.config.max_attempts
                );
                self.events.enqueue(ReconnectEvent::Scheduled { attempt, delay });
            }
        }
        self.events.drain();
    }

    async fn run_attempt(self: Arc<Self>, attempt: u32) {
        {
            let mut state = lock(&self.state);
            // Detach our own handle; aborting it here would cancel this task
            if matches!(state.pending, Some((pending, _)) if pending == attempt) {
                state.pending = None;
            }
            if !state.enabled {
                return;
            }
            state.in_flight = true;
        }

        let Some(target) = self.connection.target() else {
            self.settle(attempt, None);
            return;
        };
        debug!("Reconnect attempt {} to {}", attempt, target.endpoint);
        self.events.emit(ReconnectEvent::Attempt { attempt });

        let result = self.connection.connect(&target.endpoint, &target.params).await;
        self.settle(attempt, result.as_ref().err());
    }

    /// An attempt finished. Report a failure, then handle any loss seen meanwhile.
    fn settle(self: &Arc<Self>, attempt: u32, error: Option<&ConnectionError>) {
        let deferred = {
            let mut state = lock(&self.state);
            state.in_flight = false;
            state.deferred.take()
        };

        if let Some(e) = error {
            warn!("Reconnect attempt {} failed: {}", attempt, e);
            self.events.emit(ReconnectEvent::Failure {
                attempt,
                error: e.to_string(),
            });
        }
        if let Some((connection_id, cause)) = deferred {
            self.schedule(connection_id, cause);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let listener = self.listener.get_mut().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(id) = listener {
            self.connection.events().off(id);
        }
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        state.cancel_pending();
    }
}
