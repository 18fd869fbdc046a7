// Chat transport connection management.
// Contains connect, reconnect, disconnect, heartbeat and the single-writer send path.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use uuid::Uuid;

use super::dispatch::{lock, Dispatcher};
use super::outbound_queue::OutboundQueue;
use super::protocol::Frame;
use super::transport::{Link, Transport};
use super::{ConnectError, SendError};
use crate::config::ChatConfig;
use crate::models::{ChatMessage, Delivery, OutgoingMessage, TypingSignal};

const WRITER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub session_id: Option<String>,
    pub retry_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Returned by a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub session_id: String,
}

/// Result of draining the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
    pub remaining: usize,
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<Ready, ConnectError>>>;

enum AckOutcome {
    Accepted(ChatMessage),
    Rejected(String),
}

struct LinkHandle {
    generation: u64,
    session_id: String,
    /// Request side of the single writer task.
    writer: mpsc::Sender<String>,
    writer_task: JoinHandle<()>,
    /// Reader and heartbeat.
    background: Vec<JoinHandle<()>>,
}

impl LinkHandle {
    fn abort(self) {
        self.writer_task.abort();
        for task in self.background {
            task.abort();
        }
    }

    /// Stop reading and heartbeating; the writer drains what it already holds, then exits.
    fn close(self) {
        for task in self.background {
            task.abort();
        }
    }
}

struct ConnState {
    status: ConnectionStatus,
    retry_count: u32,
    last_heartbeat: Option<DateTime<Utc>>,
    generation: u64,
    link: Option<LinkHandle>,
}

pub(crate) struct Inner {
    transport: Arc<dyn Transport>,
    config: ChatConfig,
    actor_id: String,
    /// Bumped by `disconnect` so in-flight attempts know they were cancelled.
    epoch: AtomicU64,
    state: Mutex<ConnState>,
    in_flight: Mutex<Option<ConnectAttempt>>,
    liveness: Mutex<Option<JoinHandle<()>>>,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<AckOutcome>>>,
    queue: TokioMutex<OutboundQueue>,
    dispatcher: Dispatcher,
}

/// Handle to the one logical connection of a chat session. Clones share it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ChatConfig, actor_id: &str) -> Self {
        let queue = OutboundQueue::new(config.outbound_queue_capacity);
        ConnectionManager {
            inner: Arc::new(Inner {
                transport,
                config,
                actor_id: actor_id.to_string(),
                epoch: AtomicU64::new(0),
                state: Mutex::new(ConnState {
                    status: ConnectionStatus::Disconnected,
                    retry_count: 0,
                    last_heartbeat: None,
                    generation: 0,
                    link: None,
                }),
                in_flight: Mutex::new(None),
                liveness: Mutex::new(None),
                pending_acks: Mutex::new(HashMap::new()),
                queue: TokioMutex::new(queue),
                dispatcher: Dispatcher::new(),
            }),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Connect, or join the attempt already in flight.
    pub async fn connect(&self) -> Result<Ready, ConnectError> {
        self.drive(ConnectionStatus::Connecting).await
    }

    /// Like `connect`, but reported as `Reconnecting` while attempts run.
    pub async fn reconnect(&self) -> Result<Ready, ConnectError> {
        self.drive(ConnectionStatus::Reconnecting).await
    }

    async fn drive(&self, status: ConnectionStatus) -> Result<Ready, ConnectError> {
        if let Some(ready) = self.inner.ready() {
            return Ok(ready);
        }
        self.ensure_liveness();
        let attempt = self.shared_attempt(status);
        let outcome = attempt.clone().await;

        let mut in_flight = lock(&self.inner.in_flight);
        if in_flight.as_ref().map_or(false, |current| current.ptr_eq(&attempt)) {
            *in_flight = None;
        }
        outcome
    }

    fn shared_attempt(&self, status: ConnectionStatus) -> ConnectAttempt {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(attempt) = in_flight.as_ref() {
            if attempt.peek().is_none() {
                debug!("Connect already in flight, awaiting it");
                return attempt.clone();
            }
        }
        let weak = Arc::downgrade(&self.inner);
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let attempt = Inner::establish(weak, status, epoch).boxed().shared();
        *in_flight = Some(attempt.clone());
        attempt
    }

    pub fn attempt_in_flight(&self) -> bool {
        lock(&self.inner.in_flight)
            .as_ref()
            .map_or(false, |attempt| attempt.peek().is_none())
    }

    /// Start the periodic liveness check if it is not already running.
    fn ensure_liveness(&self) {
        let mut slot = lock(&self.inner.liveness);
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.liveness_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let manager = match weak.upgrade() {
                    Some(inner) => ConnectionManager { inner },
                    None => break,
                };
                if manager.attempt_in_flight() {
                    continue;
                }
                if manager.is_connected() {
                    if manager.inner.has_backlog() {
                        info!("Liveness check found queued messages on a live link, flushing");
                        let report = manager.flush().await;
                        debug!("Retry flush: {:?}", report);
                    }
                    continue;
                }
                info!("Liveness check found the transport down, reconnecting");
                if let Err(e) = manager.reconnect().await {
                    warn!("Reconnect failed: {}", e);
                }
            }
        }));
    }

    /// Tear down the transport, stop the liveness check and drop every listener.
    /// Queued outbound messages are kept for a later connect.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&inner.in_flight).take();
        if let Some(task) = lock(&inner.liveness).take() {
            task.abort();
        }

        let link = {
            let mut state = lock(&inner.state);
            state.status = ConnectionStatus::Disconnected;
            state.retry_count = 0;
            state.link.take()
        };
        match link {
            Some(link) => {
                info!("Disconnecting chat session {}", link.session_id);
                for consultation_id in inner.dispatcher.rooms() {
                    let leave = Frame::Leave {
                        consultation_id,
                        user_id: inner.actor_id.clone(),
                    };
                    if let Ok(text) = leave.encode() {
                        let _ = link.writer.try_send(text);
                    }
                }
                link.close();
            }
            None => debug!("Disconnect requested with no live transport"),
        }
        inner.fail_pending_acks();
        inner.dispatcher.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).status
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = lock(&self.inner.state);
        ConnectionSnapshot {
            status: state.status,
            session_id: state.link.as_ref().map(|link| link.session_id.clone()),
            retry_count: state.retry_count,
            last_heartbeat: state.last_heartbeat,
        }
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Send a message now, or queue it while the transport is down.
    ///
    /// The queue lock is held across a direct send, so concurrent sends go out
    /// one at a time in call order and a backlog is always drained first.
    pub(crate) async fn submit(&self, message: OutgoingMessage) -> Result<Delivery, SendError> {
        let request_id = Uuid::new_v4().to_string();
        let mut queue = self.inner.queue.lock().await;
        if !self.is_connected() {
            return Self::enqueue(&mut queue, request_id, message);
        }
        if !queue.is_empty() {
            // Connected with a backlog left by a stalled flush: queue behind it and retry
            let delivery = Self::enqueue(&mut queue, request_id, message)?;
            drop(queue);
            self.schedule_flush();
            return Ok(delivery);
        }

        match self.inner.send_now(&request_id, &message).await {
            Ok(stored) => Ok(Delivery::Acknowledged(stored)),
            Err(SendError::NotConnected) => {
                warn!("Link dropped before {} was acknowledged, queueing it", request_id);
                let delivery = Self::enqueue(&mut queue, request_id, message)?;
                drop(queue);
                if self.is_connected() {
                    self.schedule_flush();
                }
                Ok(delivery)
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue(
        queue: &mut OutboundQueue,
        request_id: String,
        message: OutgoingMessage,
    ) -> Result<Delivery, SendError> {
        match queue.enqueue(request_id.clone(), message) {
            Some(position) => {
                info!("Queued message {} at position {}", request_id, position);
                Ok(Delivery::Queued { request_id })
            }
            None => {
                error!("Outbound queue full ({} messages), refusing {}", queue.capacity(), request_id);
                Err(SendError::QueueFull(queue.capacity()))
            }
        }
    }

    fn schedule_flush(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.flush().await;
            }
        });
    }

    /// Drain the outbound queue in FIFO order, one acknowledgement at a time.
    pub async fn flush(&self) -> FlushReport {
        self.inner.flush().await
    }

    /// Fire-and-forget typing signal. Dropped when the transport is down.
    pub(crate) fn emit_typing(&self, consultation_id: &str, username: &str) -> bool {
        let frame = Frame::Typing {
            signal: TypingSignal {
                consultation_id: consultation_id.to_string(),
                username: username.to_string(),
            },
        };
        let sent = self.try_write_frame(&frame);
        if !sent {
            debug!("Typing signal for {} dropped", consultation_id);
        }
        sent
    }

    /// Hand a frame to the writer without waiting. `false` if there is no link or it is backed up.
    pub(crate) fn try_write_frame(&self, frame: &Frame) -> bool {
        let writer = match self.inner.writer() {
            Some(writer) => writer,
            None => return false,
        };
        match frame.encode() {
            Ok(text) => writer.try_send(text).is_ok(),
            Err(e) => {
                error!("Failed to encode {} frame: {}", frame.kind(), e);
                false
            }
        }
    }
}

impl Inner {
    fn ready(&self) -> Option<Ready> {
        let state = lock(&self.state);
        match (&state.status, &state.link) {
            (ConnectionStatus::Connected, Some(link)) => Some(Ready {
                session_id: link.session_id.clone(),
            }),
            _ => None,
        }
    }

    fn writer(&self) -> Option<mpsc::Sender<String>> {
        lock(&self.state).link.as_ref().map(|link| link.writer.clone())
    }

    /// Messages waiting with no flush holding the queue.
    fn has_backlog(&self) -> bool {
        self.queue.try_lock().map_or(false, |queue| !queue.is_empty())
    }

    fn cancelled(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn establish(
        weak: Weak<Inner>,
        status: ConnectionStatus,
        epoch: u64,
    ) -> Result<Ready, ConnectError> {
        let attempts = match weak.upgrade() {
            Some(inner) => inner.config.max_connect_attempts,
            None => return Err(ConnectError::Closed),
        };
        let mut timeouts = 0;
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            let inner = match weak.upgrade() {
                Some(inner) if !inner.cancelled(epoch) => inner,
                _ => return Err(ConnectError::Closed),
            };
            {
                let mut state = lock(&inner.state);
                state.status = status;
                state.retry_count = attempt - 1;
            }
            info!("Opening chat transport (attempt {}/{})...", attempt, attempts);

            match tokio::time::timeout(inner.config.connect_timeout(), inner.transport.open()).await {
                Ok(Ok(link)) => {
                    if inner.cancelled(epoch) {
                        info!("Session closed while connecting, dropping new link");
                        return Err(ConnectError::Closed);
                    }
                    let ready = inner.install_link(&weak, link);
                    info!("Connected to chat transport as session {}", ready.session_id);
                    inner.rejoin_rooms();
                    let report = inner.flush().await;
                    if report != FlushReport::default() {
                        info!(
                            "Flushed {} queued message(s), {} refused, {} remaining",
                            report.sent, report.dropped, report.remaining
                        );
                    }
                    return Ok(ready);
                }
                Ok(Err(e)) => {
                    error!("Failed to connect on attempt {}/{}: {}", attempt, attempts, e);
                    last_reason = e.to_string();
                }
                Err(_) => {
                    error!(
                        "Connect attempt {}/{} timed out after {:?}",
                        attempt,
                        attempts,
                        inner.config.connect_timeout()
                    );
                    timeouts += 1;
                    last_reason = "timed out".to_string();
                }
            }

            if attempt < attempts {
                let backoff = inner.config.backoff(attempt);
                drop(inner);
                info!("Retrying connection in {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        if let Some(inner) = weak.upgrade() {
            let mut state = lock(&inner.state);
            if state.link.is_none() {
                state.status = ConnectionStatus::Disconnected;
            }
        }
        error!("All {} connection attempts failed: {}", attempts, last_reason);
        if timeouts == attempts {
            Err(ConnectError::Timeout { attempts })
        } else {
            Err(ConnectError::Exhausted {
                attempts,
                reason: last_reason,
            })
        }
    }

    /// Spawn the writer, reader and heartbeat tasks for a fresh link.
    fn install_link(&self, weak: &Weak<Inner>, link: Link) -> Ready {
        let Link {
            session_id,
            outgoing,
            incoming,
        } = link;

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(WRITER_BUFFER);
        let writer_task = tokio::spawn(async move {
            while let Some(text) = writer_rx.recv().await {
                if outgoing.send(text).await.is_err() {
                    warn!("Transport closed while writing");
                    break;
                }
            }
        });

        let mut state = lock(&self.state);
        if let Some(stale) = state.link.take() {
            stale.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let reader_task = tokio::spawn(Inner::read_loop(weak.clone(), incoming, generation));
        let heartbeat_task = tokio::spawn(Inner::heartbeat_loop(
            weak.clone(),
            writer_tx.clone(),
            self.config.heartbeat_interval(),
        ));

        state.link = Some(LinkHandle {
            generation,
            session_id: session_id.clone(),
            writer: writer_tx,
            writer_task,
            background: vec![reader_task, heartbeat_task],
        });
        state.status = ConnectionStatus::Connected;
        state.retry_count = 0;
        state.last_heartbeat = Some(Utc::now());
        Ready { session_id }
    }

    fn rejoin_rooms(&self) {
        let writer = match self.writer() {
            Some(writer) => writer,
            None => return,
        };
        for consultation_id in self.dispatcher.rooms() {
            let join = Frame::Join {
                consultation_id: consultation_id.clone(),
                user_id: self.actor_id.clone(),
            };
            let text = match join.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode join for {}: {}", consultation_id, e);
                    continue;
                }
            };
            match writer.try_send(text) {
                Ok(()) => debug!("Rejoined {}", consultation_id),
                Err(_) => warn!("Could not rejoin {}: writer unavailable", consultation_id),
            }
        }
    }

    async fn read_loop(weak: Weak<Inner>, mut incoming: mpsc::Receiver<String>, generation: u64) {
        while let Some(text) = incoming.recv().await {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            match Frame::decode(&text) {
                Ok(frame) => inner.handle_frame(frame),
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            }
        }
        if let Some(inner) = weak.upgrade() {
            inner.link_lost(generation);
        }
    }

    async fn heartbeat_loop(weak: Weak<Inner>, writer: mpsc::Sender<String>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if weak.strong_count() == 0 {
                break;
            }
            let text = match Frame::Heartbeat.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode heartbeat: {}", e);
                    break;
                }
            };
            if writer.send(text).await.is_err() {
                debug!("Heartbeat stopped, writer is gone");
                break;
            }
            debug!("Sent heartbeat");
        }
    }

    fn handle_frame(&self, frame: Frame) {
        debug!("Received {} frame", frame.kind());
        match frame {
            Frame::Message { message } => self.dispatcher.deliver_message(&message),
            Frame::History {
                consultation_id,
                messages,
            } => {
                debug!("History replay of {} message(s) for {}", messages.len(), consultation_id);
                self.dispatcher.deliver_history(&consultation_id, &messages);
            }
            Frame::Ack {
                request_id,
                message,
            } => {
                // The stored copy enters the local sequence even if the sender stopped waiting
                self.dispatcher.deliver_message(&message);
                self.resolve_ack(&request_id, AckOutcome::Accepted(message));
            }
            Frame::Rejected { request_id, reason } => {
                warn!("Far end rejected {}: {}", request_id, reason);
                self.resolve_ack(&request_id, AckOutcome::Rejected(reason));
            }
            Frame::Typing { signal } => self.dispatcher.deliver_typing(&signal),
            Frame::HeartbeatAck => {
                lock(&self.state).last_heartbeat = Some(Utc::now());
            }
            other => debug!("Ignoring unexpected {} frame from far end", other.kind()),
        }
    }

    fn resolve_ack(&self, request_id: &str, outcome: AckOutcome) {
        match lock(&self.pending_acks).remove(request_id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => debug!("Late or unknown acknowledgement for {}", request_id),
        }
    }

    fn fail_pending_acks(&self) {
        let waiters: Vec<_> = lock(&self.pending_acks).drain().collect();
        if !waiters.is_empty() {
            debug!("Failing {} pending acknowledgement(s)", waiters.len());
        }
    }

    fn link_lost(&self, generation: u64) {
        let link = {
            let mut state = lock(&self.state);
            if state.link.as_ref().map(|link| link.generation) != Some(generation) {
                return;
            }
            state.status = ConnectionStatus::Disconnected;
            state.link.take()
        };
        if let Some(link) = link {
            warn!("Chat transport {} lost; liveness check will reconnect", link.session_id);
            link.abort();
        }
        self.fail_pending_acks();
    }

    async fn send_now(&self, request_id: &str, message: &OutgoingMessage) -> Result<ChatMessage, SendError> {
        let writer = self.writer().ok_or(SendError::NotConnected)?;
        let frame = Frame::Send {
            request_id: request_id.to_string(),
            message: message.clone(),
        };
        let text = frame
            .encode()
            .map_err(|e| SendError::Rejected(e.to_string()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        lock(&self.pending_acks).insert(request_id.to_string(), ack_tx);
        if writer.send(text).await.is_err() {
            lock(&self.pending_acks).remove(request_id);
            return Err(SendError::NotConnected);
        }
        debug!("Sent message {} to {}", request_id, message.consultation_id);

        match tokio::time::timeout(self.config.ack_timeout(), ack_rx).await {
            Ok(Ok(AckOutcome::Accepted(stored))) => Ok(stored),
            Ok(Ok(AckOutcome::Rejected(reason))) => Err(SendError::Rejected(reason)),
            Ok(Err(_)) => Err(SendError::NotConnected),
            Err(_) => {
                lock(&self.pending_acks).remove(request_id);
                warn!("No acknowledgement for {} within {:?}", request_id, self.config.ack_timeout());
                Err(SendError::Timeout(request_id.to_string()))
            }
        }
    }

    async fn flush(&self) -> FlushReport {
        let mut queue = self.queue.lock().await;
        let mut report = FlushReport::default();
        while let Some(head) = queue.front().cloned() {
            match self.send_now(&head.request_id, &head.message).await {
                Ok(_) => {
                    queue.pop_front();
                    report.sent += 1;
                    debug!(
                        "Delivered queued message {} after {}ms",
                        head.request_id,
                        (Utc::now() - head.queued_at).num_milliseconds()
                    );
                }
                Err(SendError::Rejected(reason)) => {
                    error!("Dropping queued message {} refused by far end: {}", head.request_id, reason);
                    queue.pop_front();
                    report.dropped += 1;
                }
                Err(e) => {
                    warn!("Flush stopped with {} message(s) left: {}", queue.len(), e);
                    break;
                }
            }
        }
        report.remaining = queue.len();
        report
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let liveness = self.liveness.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = liveness.take() {
            task.abort();
        }
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(link) = state.link.take() {
            link.abort();
        }
    }
}
