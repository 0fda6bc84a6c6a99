//! In-memory pub/sub routing decoded realtime messages to subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::message::{MessageType, RealtimeMessage};

type Handler = Arc<dyn Fn(&RealtimeMessage) + Send + Sync>;
type SubscriberMap = HashMap<MessageType, Vec<(u64, Handler)>>;

/// Routes decoded messages to the subscribers interested in their type.
///
/// Purely in-memory and scoped to the process lifetime; consumers (badge
/// counters, chat views) subscribe here and never touch the socket.
pub struct Fanout {
    subscribers: Mutex<SubscriberMap>,
    next_id: AtomicU64,
    weak_self: Weak<Fanout>,
}

impl Fanout {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            subscribers: Mutex::new(SubscriberMap::new()),
            next_id: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// Register `handler` for messages of `message_type`. Multiple
    /// subscribers per type are allowed; the guard unregisters on drop.
    pub fn subscribe<F>(&self, message_type: MessageType, handler: F) -> Subscription
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(message_type)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            fanout: self.weak_self.clone(),
            message_type,
            id,
        }
    }

    /// Deliver `message` to every subscriber of its type, in subscription
    /// order.
    ///
    /// Dispatch iterates a snapshot of the subscriber list, so a handler may
    /// unsubscribe itself or others mid-dispatch without breaking the loop.
    pub fn dispatch(&self, message: &RealtimeMessage) {
        let handlers: Vec<Handler> = self
            .lock()
            .get(&message.message_type())
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(message);
        }
    }

    fn unsubscribe(&self, message_type: MessageType, id: u64) {
        if let Some(entries) = self.lock().get_mut(&message_type) {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubscriberMap> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Guard returned by [`Fanout::subscribe`]; dropping it unregisters the
/// handler.
pub struct Subscription {
    fanout: Weak<Fanout>,
    message_type: MessageType,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.unsubscribe(self.message_type, self.id);
        }
    }
}
