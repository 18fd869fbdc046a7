// Per-consultation message channel.
// Holds the local ordered, de-duplicated sequence and the screen's handlers.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

use super::access::{self, AccessError, RoomMode};
use super::chat_states::{TypingFn, TypingTracker};
use super::connection::ConnectionManager;
use super::directory::ConsultationDirectory;
use super::dispatch::{lock, HandlerSlot, SubscriptionHandle};
use super::protocol::Frame;
use super::ChatError;
use crate::models::{Actor, ChatMessage, Delivery, OutgoingMessage, TypingSignal, TypingUpdate};

/// Messages sorted by `created_at`, ties kept in arrival order, each id at most once.
#[derive(Debug, Default)]
pub struct MessageLog {
    known_ids: HashSet<String>,
    messages: Vec<ChatMessage>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message; returns `false` if its id was already delivered.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        if let Some(id) = &message.id {
            if !self.known_ids.insert(id.clone()) {
                return false;
            }
        }
        // Upper bound among equal timestamps keeps arrival order on ties
        let at = self
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.known_ids.contains(id)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub(crate) type ReceiveFn = dyn Fn(&ChatMessage) + Send + Sync;

/// Shared between a `MessageChannel` and the dispatcher route feeding it.
pub(crate) struct ChannelState {
    log: Mutex<MessageLog>,
    receive: Arc<HandlerSlot<ReceiveFn>>,
    typing: Arc<TypingTracker>,
    closed: AtomicBool,
}

impl ChannelState {
    pub(crate) fn new(consultation_id: &str, local_name: &str, typing_expiry: Duration) -> Arc<Self> {
        Arc::new(ChannelState {
            log: Mutex::new(MessageLog::new()),
            receive: HandlerSlot::new(),
            typing: TypingTracker::new(consultation_id, local_name, typing_expiry),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn deliver(&self, message: ChatMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let inserted = lock(&self.log).insert(message.clone());
        if !inserted {
            debug!("Discarding duplicate message {:?}", message.id);
            return;
        }
        if let Some(handler) = self.receive.get() {
            handler(&message);
        }
    }

    pub(crate) fn typing_signal(&self, signal: &TypingSignal) {
        if !self.closed.load(Ordering::SeqCst) {
            self.typing.on_signal(signal);
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.receive.clear();
        self.typing.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A joined consultation room, owned by one chat screen.
///
/// Dropping the channel leaves the room and cancels its handlers and timers.
pub struct MessageChannel {
    consultation_id: String,
    mode: RoomMode,
    actor: Actor,
    directory: Arc<dyn ConsultationDirectory>,
    connection: ConnectionManager,
    state: Arc<ChannelState>,
    route: u64,
    left: AtomicBool,
}

impl MessageChannel {
    pub(crate) fn open(
        consultation_id: &str,
        mode: RoomMode,
        actor: Actor,
        directory: Arc<dyn ConsultationDirectory>,
        connection: ConnectionManager,
    ) -> Self {
        let state = ChannelState::new(
            consultation_id,
            &actor.display_name,
            connection.config().typing_expiry(),
        );
        let route = connection.dispatcher().register(consultation_id, state.clone());

        let join = Frame::Join {
            consultation_id: consultation_id.to_string(),
            user_id: actor.id.clone(),
        };
        if !connection.try_write_frame(&join) {
            warn!("Join for {} not sent now; it is replayed on reconnect", consultation_id);
        }
        info!("{} joined {} ({:?})", actor.id, consultation_id, mode);

        MessageChannel {
            consultation_id: consultation_id.to_string(),
            mode,
            actor,
            directory,
            connection,
            state,
            route,
            left: AtomicBool::new(false),
        }
    }

    pub fn consultation_id(&self) -> &str {
        &self.consultation_id
    }

    pub fn mode(&self) -> RoomMode {
        self.mode
    }

    pub fn is_history_only(&self) -> bool {
        self.mode == RoomMode::HistoryOnly
    }

    /// Send a message into the room.
    ///
    /// Access is re-evaluated against a fresh consultation snapshot first. With
    /// the transport down the message is queued and `Delivery::Queued` returned.
    pub async fn send(&self, content: &str) -> Result<Delivery, ChatError> {
        if self.left.load(Ordering::SeqCst) || self.state.is_closed() {
            return Err(ChatError::ChannelClosed(self.consultation_id.clone()));
        }
        if self.is_history_only() {
            return Err(AccessError::ConsultationEnded(self.consultation_id.clone()).into());
        }

        let consultation = super::fetch_consultation(self.directory.as_ref(), &self.consultation_id, &self.actor).await?;
        access::evaluate_send(&consultation, &self.actor)?;

        let message = OutgoingMessage::new(&self.consultation_id, &self.actor.id, content);
        let delivery = self.connection.submit(message).await?;
        Ok(delivery)
    }

    /// Install the handler for newly arrived messages, replacing any previous one.
    pub fn on_receive<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        let handler: Arc<ReceiveFn> = Arc::new(handler);
        self.state.receive.install(handler)
    }

    /// Install the handler for peer typing changes, replacing any previous one.
    pub fn on_typing<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&TypingUpdate) + Send + Sync + 'static,
    {
        let handler: Arc<TypingFn> = Arc::new(handler);
        self.state.typing.subscribe(handler)
    }

    /// Best-effort typing signal under the local display name.
    pub fn emit_typing(&self) -> bool {
        if self.left.load(Ordering::SeqCst) {
            return false;
        }
        self.connection
            .emit_typing(&self.consultation_id, &self.actor.display_name)
    }

    /// Snapshot of the local ordered sequence.
    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.state.log).messages().to_vec()
    }

    pub fn len(&self) -> usize {
        lock(&self.state.log).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state.log).is_empty()
    }

    pub fn is_peer_typing(&self, username: &str) -> bool {
        self.state.typing.is_typing(username)
    }

    pub fn typing_peers(&self) -> Vec<String> {
        self.state.typing.typing_peers()
    }

    /// Unbind from the room. Idempotent; returns `false` if already left.
    pub fn leave(&self) -> bool {
        if self.left.swap(true, Ordering::SeqCst) {
            return false;
        }
        let dispatcher = self.connection.dispatcher();
        if dispatcher.unregister(self.route).is_some() && !dispatcher.has_room(&self.consultation_id) {
            let leave = Frame::Leave {
                consultation_id: self.consultation_id.clone(),
                user_id: self.actor.id.clone(),
            };
            if !self.connection.try_write_frame(&leave) {
                debug!("Leave for {} not sent; transport is down", self.consultation_id);
            }
        }
        self.state.close();
        info!("{} left {}", self.actor.id, self.consultation_id);
        true
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.leave();
    }
}
