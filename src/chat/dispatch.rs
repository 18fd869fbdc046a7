// Routing of inbound traffic to joined rooms, and handler subscriptions.

use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::chat::channel::ChannelState;
use crate::models::{ChatMessage, TypingSignal};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A single-occupancy handler slot: installing a handler replaces the previous one.
pub(crate) struct HandlerSlot<T: ?Sized> {
    next_token: AtomicU64,
    current: Mutex<Option<(u64, Arc<T>)>>,
}

impl<T: ?Sized + Send + Sync + 'static> HandlerSlot<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(HandlerSlot {
            next_token: AtomicU64::new(1),
            current: Mutex::new(None),
        })
    }

    pub(crate) fn install(self: &Arc<Self>, handler: Arc<T>) -> SubscriptionHandle {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let replaced = lock(&self.current).replace((token, handler));
        if replaced.is_some() {
            debug!("Replaced existing handler with subscription {}", token);
        }
        let weak: Weak<HandlerSlot<T>> = Arc::downgrade(self);
        let slot: Weak<dyn Revoke> = weak;
        SubscriptionHandle { slot, token }
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        lock(&self.current).as_ref().map(|(_, handler)| handler.clone())
    }

    pub(crate) fn clear(&self) {
        lock(&self.current).take();
    }
}

trait Revoke: Send + Sync {
    fn revoke(&self, token: u64) -> bool;
    fn holds(&self, token: u64) -> bool;
}

impl<T: ?Sized + Send + Sync> Revoke for HandlerSlot<T> {
    fn revoke(&self, token: u64) -> bool {
        let mut current = lock(&self.current);
        match current.as_ref() {
            Some((held, _)) if *held == token => {
                current.take();
                true
            }
            _ => false,
        }
    }

    fn holds(&self, token: u64) -> bool {
        matches!(lock(&self.current).as_ref(), Some((held, _)) if *held == token)
    }
}

/// Returned by handler registration. A handle that was replaced by a newer
/// registration, or whose channel is gone, is inert.
pub struct SubscriptionHandle {
    slot: Weak<dyn Revoke>,
    token: u64,
}

impl SubscriptionHandle {
    /// Remove the handler. Returns `false` if it was already replaced or removed.
    pub fn unsubscribe(self) -> bool {
        match self.slot.upgrade() {
            Some(slot) => slot.revoke(self.token),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot.upgrade().map_or(false, |slot| slot.holds(self.token))
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("token", &self.token).finish()
    }
}

struct Route {
    consultation_id: String,
    channel: Arc<ChannelState>,
}

/// Fans inbound frames out to every channel joined to the frame's consultation.
pub(crate) struct Dispatcher {
    next_route: AtomicU64,
    routes: Mutex<HashMap<u64, Route>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Dispatcher {
            next_route: AtomicU64::new(1),
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, consultation_id: &str, channel: Arc<ChannelState>) -> u64 {
        let id = self.next_route.fetch_add(1, Ordering::SeqCst);
        lock(&self.routes).insert(
            id,
            Route {
                consultation_id: consultation_id.to_string(),
                channel,
            },
        );
        id
    }

    /// Remove one route; returns its consultation id if it was still registered.
    pub(crate) fn unregister(&self, route: u64) -> Option<String> {
        let removed = lock(&self.routes).remove(&route)?;
        removed.channel.close();
        Some(removed.consultation_id)
    }

    /// Remove every route of a consultation; returns how many were closed.
    pub(crate) fn unregister_room(&self, consultation_id: &str) -> usize {
        let closed: Vec<Arc<ChannelState>> = {
            let mut routes = lock(&self.routes);
            let ids: Vec<u64> = routes
                .iter()
                .filter(|(_, route)| route.consultation_id == consultation_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| routes.remove(&id))
                .map(|route| route.channel)
                .collect()
        };
        for channel in &closed {
            channel.close();
        }
        closed.len()
    }

    pub(crate) fn has_room(&self, consultation_id: &str) -> bool {
        lock(&self.routes)
            .values()
            .any(|route| route.consultation_id == consultation_id)
    }

    /// Distinct consultations with at least one joined channel.
    pub(crate) fn rooms(&self) -> Vec<String> {
        let rooms: BTreeSet<String> = lock(&self.routes)
            .values()
            .map(|route| route.consultation_id.clone())
            .collect();
        rooms.into_iter().collect()
    }

    fn channels_for(&self, consultation_id: &str) -> Vec<Arc<ChannelState>> {
        lock(&self.routes)
            .values()
            .filter(|route| route.consultation_id == consultation_id)
            .map(|route| route.channel.clone())
            .collect()
    }

    pub(crate) fn deliver_message(&self, message: &ChatMessage) {
        let channels = self.channels_for(&message.consultation_id);
        if channels.is_empty() {
            debug!("No joined channel for message in {}", message.consultation_id);
        }
        for channel in channels {
            channel.deliver(message.clone());
        }
    }

    pub(crate) fn deliver_history(&self, consultation_id: &str, messages: &[ChatMessage]) {
        for channel in self.channels_for(consultation_id) {
            for message in messages {
                channel.deliver(message.clone());
            }
        }
    }

    pub(crate) fn deliver_typing(&self, signal: &TypingSignal) {
        for channel in self.channels_for(&signal.consultation_id) {
            channel.typing_signal(signal);
        }
    }

    /// Drop every route and close its channel.
    pub(crate) fn clear(&self) {
        let routes: Vec<Route> = lock(&self.routes).drain().map(|(_, route)| route).collect();
        for route in routes {
            route.channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = dyn Fn(u32) + Send + Sync;

    #[test]
    fn test_install_replaces_previous_handler() {
        let slot: Arc<HandlerSlot<Callback>> = HandlerSlot::new();
        let first = slot.install(Arc::new(|_: u32| {}));
        let second = slot.install(Arc::new(|_: u32| {}));

        assert!(!first.is_active());
        assert!(second.is_active());
        // Revoking the stale handle must not remove the newer handler
        assert!(!first.unsubscribe());
        assert!(slot.get().is_some());
        assert!(second.unsubscribe());
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_handle_outliving_slot_is_inert() {
        let slot: Arc<HandlerSlot<Callback>> = HandlerSlot::new();
        let handle = slot.install(Arc::new(|_: u32| {}));
        drop(slot);
        assert!(!handle.is_active());
        assert!(!handle.unsubscribe());
    }
}
