// Heartbeat monitor
// Pings the connection on an interval and reports when the peer stops answering

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ConnectionEvent, ConnectionManager};
use crate::config::HeartbeatConfig;
use crate::events::{lock, EventBus, ListenerId, NamedEvent};
use crate::models::{now_timestamp, ConnectionStatus};
use crate::wire::{decode_json, is_heartbeat, Serializer};

#[derive(Debug, Clone)]
pub enum HeartbeatEvent {
    Sent { ping_id: String },
    Ack { at: DateTime<Utc> },
    Missed { failed_count: u32 },
    /// The failure streak reached the limit. Fires once per streak.
    Dead {
        failed_count: u32,
        last_response_at: Option<DateTime<Utc>>,
    },
}

impl NamedEvent for HeartbeatEvent {
    fn name(&self) -> &'static str {
        match self {
            HeartbeatEvent::Sent { .. } => "heartbeatSent",
            HeartbeatEvent::Ack { .. } => "heartbeatAck",
            HeartbeatEvent::Missed { .. } => "heartbeatMissed",
            HeartbeatEvent::Dead { .. } => "dead",
        }
    }
}

/// Watches one `ConnectionManager`. Cloning shares the monitor.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    connection: ConnectionManager,
    serializer: Serializer,
    config: HeartbeatConfig,
    state: Mutex<State>,
    events: EventBus<HeartbeatEvent>,
    listeners: Mutex<Vec<ListenerId>>,
}

#[derive(Default)]
struct State {
    enabled: bool,
    failed_count: u32,
    awaiting_ack: bool,
    dead_signalled: bool,
    last_response_at: Option<DateTime<Utc>>,
    ticker: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Attach to `connection`. With `config.enabled`, probing starts whenever it connects.
    pub fn new(connection: ConnectionManager, config: HeartbeatConfig, serializer: Serializer) -> Self {
        let inner = Arc::new(Inner {
            connection,
            serializer,
            config,
            state: Mutex::new(State::default()),
            events: EventBus::new(),
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let on_status = inner.connection.events().on("statusChange", move |event| {
            let (Some(inner), ConnectionEvent::StatusChange { status, .. }) = (weak.upgrade(), event)
            else {
                return;
            };
            let monitor = HeartbeatMonitor { inner };
            match status {
                ConnectionStatus::Connected if monitor.inner.config.enabled => {
                    monitor.start();
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                    monitor.stop();
                }
                _ => {}
            }
        });

        let weak = Arc::downgrade(&inner);
        let on_message = inner.connection.events().on("message", move |event| {
            let (Some(inner), ConnectionEvent::Message { payload, .. }) = (weak.upgrade(), event) else {
                return;
            };
            if decode_json(payload).map_or(false, |value| is_heartbeat(&value)) {
                HeartbeatMonitor { inner }.acknowledge();
            }
        });

        lock(&inner.listeners).extend([on_status, on_message]);
        HeartbeatMonitor { inner }
    }

    pub fn events(&self) -> &EventBus<HeartbeatEvent> {
        &self.inner.events
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.state).enabled
    }

    pub fn failed_count(&self) -> u32 {
        lock(&self.inner.state).failed_count
    }

    pub fn last_response_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.state).last_response_at
    }

    /// Begin probing every `interval`. Returns false if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.enabled {
            return false;
        }
        state.enabled = true;
        state.failed_count = 0;
        state.awaiting_ack = false;
        state.dead_signalled = false;

        let interval = self.inner.config.interval();
        state.ticker = Some(tokio::spawn(run_ticker(Arc::downgrade(&self.inner), interval)));
        debug!("Heartbeat started, probing every {:?}", interval);
        true
    }

    /// Stop probing. Safe to call at any time.
    pub fn stop(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        let was_enabled = state.enabled;
        state.enabled = false;
        state.awaiting_ack = false;
        if was_enabled {
            debug!("Heartbeat stopped");
        }
        was_enabled
    }

    /// Run one heartbeat cycle now. Does nothing while stopped.
    pub fn tick(&self) {
        let inner = &self.inner;
        let connected = inner.connection.is_connected();

        let unanswered = {
            let mut state = lock(&inner.state);
            if !state.enabled {
                return;
            }
            let unanswered = state.awaiting_ack;
            // Set before sending so an ack racing the send is not overwritten
            if connected {
                state.awaiting_ack = true;
            }
            unanswered
        };

        let mut sent = false;
        if connected {
            let ping_id = uuid::Uuid::new_v4().to_string();
            let ping = json!({
                "type": "heartbeat",
                "id": ping_id,
                "timestamp": now_timestamp(),
            });
            match inner.serializer.serialize(&ping) {
                Ok(payload) => sent = inner.connection.send(payload),
                Err(e) => warn!("Could not encode heartbeat ping: {}", e),
            }
            if sent {
                inner.events.enqueue(HeartbeatEvent::Sent { ping_id });
            }
        }

        {
            let mut state = lock(&inner.state);
            if connected && !sent {
                state.awaiting_ack = false;
            }
            if state.enabled && (!connected || unanswered || !sent) {
                state.failed_count += 1;
                let failed_count = state.failed_count;
                debug!("Heartbeat missed ({}/{})", failed_count, inner.config.max_failures);
                inner.events.enqueue(HeartbeatEvent::Missed { failed_count });

                if failed_count >= inner.config.max_failures && !state.dead_signalled {
                    state.dead_signalled = true;
                    warn!("Connection presumed dead after {} missed heartbeats", failed_count);
                    inner.events.enqueue(HeartbeatEvent::Dead {
                        failed_count,
                        last_response_at: state.last_response_at,
                    });
                }
            }
        }
        inner.events.drain();
    }

    /// Record a heartbeat response from the peer.
    pub fn acknowledge(&self) {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            let at = Utc::now();
            if state.dead_signalled {
                info!("Heartbeat answered again after {} misses", state.failed_count);
            }
            state.failed_count = 0;
            state.awaiting_ack = false;
            state.dead_signalled = false;
            state.last_response_at = Some(at);
            inner.events.enqueue(HeartbeatEvent::Ack { at });
        }
        inner.events.drain();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for id in lock(&self.listeners).drain(..) {
            self.connection.events().off(id);
        }
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
    }
}

async fn run_ticker(inner: Weak<Inner>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        HeartbeatMonitor { inner }.tick();
    }
}
