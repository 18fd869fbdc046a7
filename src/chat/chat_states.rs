// Typing notifications.
// Receiving side keeps one expiry timer per peer; a fresh signal re-arms it.

use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use super::dispatch::{lock, HandlerSlot, SubscriptionHandle};
use crate::models::{TypingSignal, TypingUpdate};

pub(crate) type TypingFn = dyn Fn(&TypingUpdate) + Send + Sync;

struct PeerTimer {
    generation: u64,
    expiry: JoinHandle<()>,
}

pub(crate) struct TypingTracker {
    consultation_id: String,
    local_name: String,
    expiry: Duration,
    next_generation: AtomicU64,
    peers: Mutex<HashMap<String, PeerTimer>>,
    handler: Arc<HandlerSlot<TypingFn>>,
}

impl TypingTracker {
    pub(crate) fn new(consultation_id: &str, local_name: &str, expiry: Duration) -> Arc<Self> {
        Arc::new(TypingTracker {
            consultation_id: consultation_id.to_string(),
            local_name: local_name.to_string(),
            expiry,
            next_generation: AtomicU64::new(1),
            peers: Mutex::new(HashMap::new()),
            handler: HandlerSlot::new(),
        })
    }

    pub(crate) fn subscribe(&self, handler: Arc<TypingFn>) -> SubscriptionHandle {
        self.handler.install(handler)
    }

    /// A peer signalled typing. Our own echo is ignored.
    pub(crate) fn on_signal(self: &Arc<Self>, signal: &TypingSignal) {
        if signal.username == self.local_name {
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let weak: Weak<TypingTracker> = Arc::downgrade(self);
        let username = signal.username.clone();
        let expiry = self.expiry;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if let Some(tracker) = weak.upgrade() {
                tracker.expire(&username, generation);
            }
        });

        let previous = lock(&self.peers).insert(
            signal.username.clone(),
            PeerTimer {
                generation,
                expiry: timer,
            },
        );
        match previous {
            Some(stale) => stale.expiry.abort(),
            None => {
                debug!("{} started typing in {}", signal.username, self.consultation_id);
                self.notify(&signal.username, true);
            }
        }
    }

    fn expire(&self, username: &str, generation: u64) {
        let expired = {
            let mut peers = lock(&self.peers);
            match peers.get(username) {
                Some(timer) if timer.generation == generation => peers.remove(username).is_some(),
                _ => false,
            }
        };
        if expired {
            debug!("Typing indicator for {} in {} expired", username, self.consultation_id);
            self.notify(username, false);
        }
    }

    fn notify(&self, username: &str, is_typing: bool) {
        if let Some(handler) = self.handler.get() {
            handler(&TypingUpdate {
                consultation_id: self.consultation_id.clone(),
                username: username.to_string(),
                is_typing,
            });
        }
    }

    pub(crate) fn is_typing(&self, username: &str) -> bool {
        lock(&self.peers).contains_key(username)
    }

    pub(crate) fn typing_peers(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.peers).keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every timer and drop the handler.
    pub(crate) fn shutdown(&self) {
        for (_, timer) in lock(&self.peers).drain() {
            timer.expiry.abort();
        }
        self.handler.clear();
    }
}
