//! Derived presence and typing state.
//!
//! Both maps are built from inbound frames only and are cleared when the
//! connection is lost; the server resends state after a rejoin.

use dashmap::DashMap;
use murmur_protocol::{PresenceStatus, PresenceUpdate, TypingEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Latest known presence per user.
#[derive(Debug, Default)]
pub struct PresenceMap {
    users: DashMap<String, PresenceUpdate>,
}

impl PresenceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update. Returns `true` if the user was not known before.
    pub fn apply(&self, update: PresenceUpdate) -> bool {
        let user_id = update.user_id.clone();
        let is_new = self.users.insert(user_id.clone(), update).is_none();
        if is_new {
            debug!(user = %user_id, "Presence: user seen");
        }
        is_new
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PresenceUpdate> {
        self.users.get(user_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn status(&self, user_id: &str) -> Option<PresenceStatus> {
        self.users.get(user_id).map(|entry| entry.status)
    }

    /// Users whose latest status is anything but offline, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .users
            .iter()
            .filter(|entry| entry.status != PresenceStatus::Offline)
            .map(|entry| entry.key().clone())
            .collect();
        users.sort();
        users
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceUpdate> {
        self.users.iter().map(|entry| entry.value().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&self) {
        self.users.clear();
    }
}

/// Key of a typing indicator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypingKey {
    pub room_id: String,
    pub user_id: String,
}

impl TypingKey {
    fn of(event: &TypingEvent) -> Self {
        Self {
            room_id: event.room_id.clone(),
            user_id: event.user_id.clone(),
        }
    }
}

struct TypingEntry {
    event: TypingEvent,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Users currently typing, per room, with local expiry.
///
/// Every "is typing" event (re)starts a timer; when it fires with no refresh
/// in between, the entry is removed and the expiry callback runs.
pub struct TypingMap {
    entries: Arc<DashMap<TypingKey, TypingEntry>>,
    expiry: Duration,
    generation: AtomicU64,
}

impl TypingMap {
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            expiry,
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Track a typing event. Must run inside a tokio runtime.
    ///
    /// `on_expire` receives the last event for the key if its timer fires.
    pub fn observe<F>(&self, event: &TypingEvent, on_expire: F)
    where
        F: FnOnce(TypingEvent) + Send + 'static,
    {
        let key = TypingKey::of(event);

        if !event.is_typing {
            if let Some((_, entry)) = self.entries.remove(&key) {
                abort_timer(entry);
                trace!(room = %key.room_id, user = %key.user_id, "Typing stopped");
            }
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.entries.insert(
            key.clone(),
            TypingEntry {
                event: event.clone(),
                generation,
                timer: None,
            },
        );
        if let Some(previous) = previous {
            abort_timer(previous);
        }

        let entries = Arc::clone(&self.entries);
        let expiry = self.expiry;
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            let expired = entries.remove_if(&timer_key, |_, entry| entry.generation == generation);
            if let Some((_, entry)) = expired {
                debug!(room = %timer_key.room_id, user = %timer_key.user_id, "Typing indicator expired");
                on_expire(entry.event);
            }
        });

        match self.entries.get_mut(&key) {
            Some(mut entry) if entry.generation == generation => entry.timer = Some(timer),
            // Superseded before the timer was stored
            _ => timer.abort(),
        }
    }

    #[must_use]
    pub fn is_typing(&self, room_id: &str, user_id: &str) -> bool {
        self.entries.contains_key(&TypingKey {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        })
    }

    /// Users typing in `room_id`, sorted.
    #[must_use]
    pub fn typing_in(&self, room_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().room_id == room_id)
            .map(|entry| entry.key().user_id.clone())
            .collect();
        users.sort();
        users
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every indicator and cancel its timer, without expiry callbacks.
    pub fn clear(&self) {
        let keys: Vec<TypingKey> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                abort_timer(entry);
            }
        }
    }
}

impl std::fmt::Debug for TypingMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingMap")
            .field("entries", &self.entries.len())
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Drop for TypingMap {
    fn drop(&mut self) {
        self.clear();
    }
}

fn abort_timer(entry: TypingEntry) {
    if let Some(timer) = entry.timer {
        timer.abort();
    }
}
