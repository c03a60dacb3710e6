//! Inbound event routing by frame kind.
//!
//! Handlers for a kind run in registration order. Delivery is at most once
//! per live subscriber; nothing is buffered for subscribers that come later.

use dashmap::DashMap;
use murmur_protocol::{now_millis, Frame, FrameKind, TypingEvent};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace};

use crate::presence::{PresenceMap, TypingMap};

/// Frame handler. Must not block: it runs on the connection's driver task.
pub type Handler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    handlers: DashMap<FrameKind, Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl Registry {
    fn add(&self, kind: FrameKind, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    fn remove(&self, kind: FrameKind, id: SubscriptionId) -> bool {
        let Some(mut list) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    /// Run every handler for the frame's kind. Returns how many ran.
    fn deliver(&self, frame: &Frame) -> usize {
        let kind = frame.kind();

        // Snapshot so handlers can (un)subscribe without deadlocking
        let handlers: Vec<Handler> = match self.handlers.get(&kind) {
            Some(list) => list.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
            None => return 0,
        };

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
                error!(%kind, "Event handler panicked");
            }
        }
        handlers.len()
    }

    fn count(&self, kind: FrameKind) -> usize {
        self.handlers.get(&kind).map_or(0, |list| list.len())
    }
}

/// Handle to one registration.
///
/// Dropping it keeps the handler registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    kind: FrameKind,
    id: SubscriptionId,
    registry: Weak<Registry>,
}

impl Subscription {
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let removed = self
            .registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.kind, self.id));
        if removed {
            debug!(kind = %self.kind, id = self.id.0, "Unsubscribed");
        }
        removed
    }
}

/// Routes inbound frames to subscribers and keeps the derived presence and
/// typing maps.
pub struct EventDispatcher {
    registry: Arc<Registry>,
    presence: PresenceMap,
    typing: TypingMap,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(typing_expiry: Duration) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            presence: PresenceMap::new(),
            typing: TypingMap::new(typing_expiry),
        }
    }

    /// Register `handler` for every frame of `kind`.
    pub fn subscribe<F>(&self, kind: FrameKind, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let id = self.registry.add(kind, Arc::new(handler));
        debug!(%kind, id = id.0, "Subscribed");
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Update derived state, then deliver the frame to its subscribers.
    ///
    /// Must run inside a tokio runtime: typing events start expiry timers.
    pub fn dispatch(&self, frame: &Frame) {
        match frame {
            Frame::PresenceUpdate(update) => {
                self.presence.apply(update.clone());
            }
            Frame::Typing(event) => {
                let registry = Arc::downgrade(&self.registry);
                self.typing.observe(event, move |expired| {
                    if let Some(registry) = registry.upgrade() {
                        registry.deliver(&typing_stopped(expired));
                    }
                });
            }
            _ => {}
        }

        let delivered = self.registry.deliver(frame);
        trace!(kind = %frame.kind(), delivered, "Dispatched frame");
    }

    #[must_use]
    pub fn subscriber_count(&self, kind: FrameKind) -> usize {
        self.registry.count(kind)
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    #[must_use]
    pub fn typing(&self) -> &TypingMap {
        &self.typing
    }

    /// Forget derived state. Subscribers stay registered.
    pub fn clear_derived(&self) {
        self.presence.clear();
        self.typing.clear();
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("kinds", &self.registry.handlers.len())
            .field("presence", &self.presence.len())
            .field("typing", &self.typing)
            .finish()
    }
}

/// The frame delivered when a typing indicator expires locally.
fn typing_stopped(last: TypingEvent) -> Frame {
    Frame::Typing(TypingEvent {
        is_typing: false,
        timestamp: now_millis(),
        ..last
    })
}
