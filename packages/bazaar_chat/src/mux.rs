//! Event multiplexer: many independent subscribers over one connection.
//!
//! Handlers are keyed by [`EventKind`] and invoked synchronously, in
//! registration order, on the connection's reader task. Each registration
//! returns a [`Subscription`] guard; dropping the guard removes exactly that
//! handler and nothing else.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, trace};

use crate::locked;
use crate::protocol::{ActivityNotification, EventKind, Message, ServerEvent, TypingStatus};

type Handler = Box<dyn Fn(&ServerEvent) + Send + Sync>;

struct Entry {
    id: u64,
    kind: EventKind,
    /// Cleared on unsubscribe so an emission already in flight skips it.
    live: AtomicBool,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Arc<Entry>>,
}

/// Typed view of a server event payload, used by [`EventMux::on`].
pub trait EventPayload: Send + Sync + 'static {
    const KIND: EventKind;

    fn from_event(event: &ServerEvent) -> Option<&Self>;
}

impl EventPayload for Message {
    const KIND: EventKind = EventKind::NewMessage;

    fn from_event(event: &ServerEvent) -> Option<&Self> {
        match event {
            ServerEvent::NewMessage(m) => Some(m),
            _ => None,
        }
    }
}

impl EventPayload for ActivityNotification {
    const KIND: EventKind = EventKind::ActivityNotification;

    fn from_event(event: &ServerEvent) -> Option<&Self> {
        match event {
            ServerEvent::ActivityNotification(n) => Some(n),
            _ => None,
        }
    }
}

impl EventPayload for TypingStatus {
    const KIND: EventKind = EventKind::PeerTyping;

    fn from_event(event: &ServerEvent) -> Option<&Self> {
        match event {
            ServerEvent::PeerTyping(t) => Some(t),
            _ => None,
        }
    }
}

/// Publish/subscribe registry. Cheap to clone; clones share one registry.
#[derive(Clone, Default)]
pub struct EventMux {
    registry: Arc<Mutex<Registry>>,
}

impl EventMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a typed payload.
    pub fn on<P, F>(&self, handler: F) -> Subscription
    where
        P: EventPayload,
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.on_event(P::KIND, move |event| {
            if let Some(payload) = P::from_event(event) {
                handler(payload);
            }
        })
    }

    /// Register a handler receiving the whole event for `kind`.
    ///
    /// Registering the same closure twice yields two independent entries.
    pub fn on_event<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut registry = locked(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push(Arc::new(Entry {
            id,
            kind,
            live: AtomicBool::new(true),
            handler: Box::new(handler),
        }));
        trace!(event = kind.as_str(), subscription = id, "subscribed");
        Subscription {
            id,
            kind,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every live handler of its kind, in registration
    /// order. A panicking handler is logged and skipped.
    pub fn emit(&self, event: &ServerEvent) {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let targets: Vec<Arc<Entry>> = locked(&self.registry)
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();

        for entry in targets {
            if !entry.live.load(Ordering::Acquire) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(event)));
            if outcome.is_err() {
                error!(
                    event = kind.as_str(),
                    subscription = entry.id,
                    "event handler panicked"
                );
            }
        }
    }

    /// Number of live handlers for `kind`.
    pub fn len(&self, kind: EventKind) -> usize {
        locked(&self.registry)
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        locked(&self.registry).entries.is_empty()
    }

    /// Drop every subscription. Outstanding guards become no-ops.
    pub fn clear(&self) {
        let drained: Vec<Arc<Entry>> = locked(&self.registry).entries.drain(..).collect();
        for entry in drained {
            entry.live.store(false, Ordering::Release);
        }
    }
}

fn remove(registry: &Mutex<Registry>, id: u64) -> bool {
    let mut registry = locked(registry);
    match registry.entries.iter().position(|e| e.id == id) {
        Some(index) => {
            let entry = registry.entries.remove(index);
            entry.live.store(false, Ordering::Release);
            true
        }
        None => false,
    }
}

/// Registration handle. Dropping it unsubscribes the handler.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Explicitly remove the handler.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if remove(&registry, self.id) {
                trace!(event = self.kind.as_str(), subscription = self.id, "unsubscribed");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
