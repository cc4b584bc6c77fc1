//! Named-event observer used by every component.
//!
//! Handlers run synchronously, in registration order, never while the bus or
//! the emitting component holds a lock. Components `enqueue` events while
//! still holding their own state lock and `drain` once it is released; only
//! one caller drains at a time, so events reach listeners in the order they
//! were enqueued even when several tasks emit concurrently. An event emitted
//! from inside a handler is delivered after that handler returns.
//!
//! Channel subscribers get a clone of every event and are pruned once their
//! receiver is dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Events that can be filtered by name, e.g. `"statusChange"`.
pub trait NamedEvent: Clone + Send + 'static {
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Target<E> {
    Handler(Handler<E>),
    Channel(mpsc::UnboundedSender<E>),
}

impl<E> Clone for Target<E> {
    fn clone(&self) -> Self {
        match self {
            Target::Handler(h) => Target::Handler(h.clone()),
            Target::Channel(tx) => Target::Channel(tx.clone()),
        }
    }
}

struct Listener<E> {
    id: ListenerId,
    filter: Option<&'static str>,
    target: Target<E>,
}

struct Dispatch<E> {
    pending: VecDeque<E>,
    draining: bool,
}

pub struct EventBus<E> {
    listeners: Mutex<Vec<Listener<E>>>,
    dispatch: Mutex<Dispatch<E>>,
    next_id: AtomicU64,
}

/// Releases the draining flag if a handler unwinds mid-drain.
struct DrainGuard<'a, E> {
    dispatch: &'a Mutex<Dispatch<E>>,
    armed: bool,
}

impl<E> Drop for DrainGuard<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.dispatch).draining = false;
        }
    }
}

impl<E: NamedEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: NamedEvent> EventBus<E> {
    pub fn new() -> Self {
        EventBus {
            listeners: Mutex::new(Vec::new()),
            dispatch: Mutex::new(Dispatch {
                pending: VecDeque::new(),
                draining: false,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for events called `name`.
    pub fn on<F>(&self, name: &'static str, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(name), Target::Handler(Arc::new(handler)))
    }

    /// Register a handler for every event.
    pub fn on_any<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Target::Handler(Arc::new(handler)))
    }

    /// Remove a listener. Returns whether one was registered under `id`.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Receive every event on a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(None, Target::Channel(tx));
        rx
    }

    pub fn stream(&self) -> UnboundedReceiverStream<E> {
        UnboundedReceiverStream::new(self.subscribe())
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub(crate) fn emit(&self, event: E) {
        self.enqueue(event);
        self.drain();
    }

    /// Queue an event without delivering it. Pair with `drain`.
    pub(crate) fn enqueue(&self, event: E) {
        lock(&self.dispatch).pending.push_back(event);
    }

    /// Deliver queued events unless another caller is already doing so.
    pub(crate) fn drain(&self) {
        {
            let mut dispatch = lock(&self.dispatch);
            if dispatch.draining {
                return;
            }
            dispatch.draining = true;
        }
        let mut guard = DrainGuard {
            dispatch: &self.dispatch,
            armed: true,
        };

        loop {
            let next = {
                let mut dispatch = lock(&self.dispatch);
                match dispatch.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        dispatch.draining = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            self.deliver(next);
        }
    }

    fn deliver(&self, event: E) {
        let name = event.name();
        let targets: Vec<(ListenerId, Target<E>)> = lock(&self.listeners)
            .iter()
            .filter(|l| l.filter.map_or(true, |f| f == name))
            .map(|l| (l.id, l.target.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, target) in targets {
            match target {
                Target::Handler(handler) => handler(&event),
                Target::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            lock(&self.listeners).retain(|l| !closed.contains(&l.id));
        }
    }

    fn register(&self, filter: Option<&'static str>, target: Target<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push(Listener { id, filter, target });
        id
    }
}

/// Locks a std mutex, recovering the data if a handler panicked while it was held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
