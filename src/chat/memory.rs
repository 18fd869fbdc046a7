// In-process far end for the chat transport.
// Keeps rooms and their history, stamps and acknowledges sends, relays typing,
// and can be taken offline, made to refuse content or made to drop every link.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

use super::dispatch::lock;
use super::protocol::Frame;
use super::transport::{Link, Transport, TransportError};
use crate::models::{ChatMessage, OutgoingMessage};

const LINK_BUFFER: usize = 256;

struct Peer {
    tx: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Room {
    members: HashSet<String>,
    history: Vec<ChatMessage>,
}

struct HubState {
    online: bool,
    acks_enabled: bool,
    open_delay: Duration,
    next_session: u64,
    open_attempts: usize,
    sessions_opened: usize,
    heartbeats: usize,
    /// Sends with these contents are refused with a `rejected` frame.
    refused_contents: HashSet<String>,
    peers: HashMap<String, Peer>,
    rooms: HashMap<String, Room>,
    /// request id -> stored message, so a resent request is acknowledged, not stored twice
    accepted: HashMap<String, ChatMessage>,
}

enum SendOutcome {
    /// Acks disabled: no reply at all.
    Swallowed,
    Refused,
    /// `fresh` is false for a resend of an already stored request.
    Stored { stored: ChatMessage, fresh: bool },
}

#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        MemoryHub {
            state: Arc::new(Mutex::new(HubState {
                online: true,
                acks_enabled: true,
                open_delay: Duration::ZERO,
                next_session: 0,
                open_attempts: 0,
                sessions_opened: 0,
                heartbeats: 0,
                refused_contents: HashSet::new(),
                peers: HashMap::new(),
                rooms: HashMap::new(),
                accepted: HashMap::new(),
            })),
        }
    }

    /// While offline every `open` is refused.
    pub fn set_online(&self, online: bool) {
        lock(&self.state).online = online;
    }

    /// With acks disabled, sends are swallowed without reply.
    pub fn set_acks_enabled(&self, enabled: bool) {
        lock(&self.state).acks_enabled = enabled;
    }

    /// Refuse every send carrying exactly this content.
    pub fn refuse_content(&self, content: &str) {
        lock(&self.state).refused_contents.insert(content.to_string());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        lock(&self.state).open_delay = delay;
    }

    /// Sever every live link, as a network drop would.
    pub fn drop_connections(&self) {
        let peers: Vec<(String, Peer)> = {
            let mut state = lock(&self.state);
            let peers: Vec<(String, Peer)> = state.peers.drain().collect();
            for room in state.rooms.values_mut() {
                room.members.clear();
            }
            peers
        };
        info!("Dropping {} live link(s)", peers.len());
        for (_, peer) in peers {
            peer.task.abort();
        }
    }

    pub fn open_attempts(&self) -> usize {
        lock(&self.state).open_attempts
    }

    pub fn sessions_opened(&self) -> usize {
        lock(&self.state).sessions_opened
    }

    pub fn live_sessions(&self) -> usize {
        lock(&self.state).peers.len()
    }

    pub fn heartbeats(&self) -> usize {
        lock(&self.state).heartbeats
    }

    pub fn members(&self, consultation_id: &str) -> usize {
        lock(&self.state)
            .rooms
            .get(consultation_id)
            .map_or(0, |room| room.members.len())
    }

    /// Stored messages of a room in the order the far end accepted them.
    pub fn history(&self, consultation_id: &str) -> Vec<ChatMessage> {
        lock(&self.state)
            .rooms
            .get(consultation_id)
            .map(|room| room.history.clone())
            .unwrap_or_default()
    }

    /// Push a message frame to every member of its room verbatim, bypassing storage.
    /// Lets tests replay duplicates and out-of-order arrivals.
    pub async fn push(&self, message: ChatMessage) {
        let targets = self.room_targets(&message.consultation_id, None);
        self.fan_out(targets, &Frame::Message { message }).await;
    }

    fn room_targets(&self, consultation_id: &str, except: Option<&str>) -> Vec<mpsc::Sender<String>> {
        let state = lock(&self.state);
        let room = match state.rooms.get(consultation_id) {
            Some(room) => room,
            None => return Vec::new(),
        };
        room.members
            .iter()
            .filter(|member| Some(member.as_str()) != except)
            .filter_map(|member| state.peers.get(member).map(|peer| peer.tx.clone()))
            .collect()
    }

    fn peer_target(&self, session_id: &str) -> Vec<mpsc::Sender<String>> {
        lock(&self.state)
            .peers
            .get(session_id)
            .map(|peer| vec![peer.tx.clone()])
            .unwrap_or_default()
    }

    async fn fan_out(&self, targets: Vec<mpsc::Sender<String>>, frame: &Frame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Hub failed to encode {} frame: {}", frame.kind(), e);
                return;
            }
        };
        for tx in targets {
            if tx.send(text.clone()).await.is_err() {
                debug!("Hub dropped {} frame for a closed link", frame.kind());
            }
        }
    }

    async fn serve(self, session_id: String, mut incoming: mpsc::Receiver<String>) {
        while let Some(text) = incoming.recv().await {
            match Frame::decode(&text) {
                Ok(frame) => self.handle(&session_id, frame).await,
                Err(e) => warn!("Hub dropping undecodable frame from {}: {}", session_id, e),
            }
        }
        let mut state = lock(&self.state);
        state.peers.remove(&session_id);
        for room in state.rooms.values_mut() {
            room.members.remove(&session_id);
        }
        debug!("Hub closed session {}", session_id);
    }

    fn accept_send(&self, request_id: &str, message: &OutgoingMessage) -> SendOutcome {
        let mut state = lock(&self.state);
        if !state.acks_enabled {
            return SendOutcome::Swallowed;
        }
        if state.refused_contents.contains(&message.content) {
            return SendOutcome::Refused;
        }
        if let Some(stored) = state.accepted.get(request_id) {
            return SendOutcome::Stored {
                stored: stored.clone(),
                fresh: false,
            };
        }
        let stored = ChatMessage {
            id: Some(Uuid::new_v4().to_string()),
            consultation_id: message.consultation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
        };
        state.accepted.insert(request_id.to_string(), stored.clone());
        state
            .rooms
            .entry(message.consultation_id.clone())
            .or_default()
            .history
            .push(stored.clone());
        SendOutcome::Stored { stored, fresh: true }
    }

    async fn handle(&self, session_id: &str, frame: Frame) {
        match frame {
            Frame::Join { consultation_id, user_id } => {
                let history = {
                    let mut state = lock(&self.state);
                    let room = state.rooms.entry(consultation_id.clone()).or_default();
                    room.members.insert(session_id.to_string());
                    room.history.clone()
                };
                debug!("Hub: {} joined {} on {}", user_id, consultation_id, session_id);
                let targets = self.peer_target(session_id);
                self.fan_out(targets, &Frame::History { consultation_id, messages: history })
                    .await;
            }
            Frame::Leave { consultation_id, .. } => {
                let mut state = lock(&self.state);
                if let Some(room) = state.rooms.get_mut(&consultation_id) {
                    room.members.remove(session_id);
                }
            }
            Frame::Send { request_id, message } => {
                let (stored, fresh) = match self.accept_send(&request_id, &message) {
                    SendOutcome::Stored { stored, fresh } => (stored, fresh),
                    SendOutcome::Swallowed => {
                        debug!("Hub swallowing send {}", request_id);
                        return;
                    }
                    SendOutcome::Refused => {
                        info!("Hub refusing send {}", request_id);
                        let targets = self.peer_target(session_id);
                        let reason = "content refused by moderation".to_string();
                        self.fan_out(targets, &Frame::Rejected { request_id, reason }).await;
                        return;
                    }
                };
                if fresh {
                    let targets = self.room_targets(&stored.consultation_id, None);
                    self.fan_out(targets, &Frame::Message { message: stored.clone() }).await;
                }
                let targets = self.peer_target(session_id);
                self.fan_out(targets, &Frame::Ack { request_id, message: stored }).await;
            }
            Frame::Typing { signal } => {
                let targets = self.room_targets(&signal.consultation_id, Some(session_id));
                self.fan_out(targets, &Frame::Typing { signal }).await;
            }
            Frame::Heartbeat => {
                lock(&self.state).heartbeats += 1;
                let targets = self.peer_target(session_id);
                self.fan_out(targets, &Frame::HeartbeatAck).await;
            }
            other => debug!("Hub ignoring {} frame from a client", other.kind()),
        }
    }
}

#[async_trait]
impl Transport for MemoryHub {
    async fn open(&self) -> Result<Link, TransportError> {
        let delay = {
            let mut state = lock(&self.state);
            state.open_attempts += 1;
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if !state.online {
            return Err(TransportError::Refused("hub is offline".to_string()));
        }
        state.next_session += 1;
        state.sessions_opened += 1;
        let session_id = format!("session-{}", state.next_session);

        let (client_tx, hub_rx) = mpsc::channel(LINK_BUFFER);
        let (hub_tx, client_rx) = mpsc::channel(LINK_BUFFER);
        let task = tokio::spawn(self.clone().serve(session_id.clone(), hub_rx));
        state.peers.insert(session_id.clone(), Peer { tx: hub_tx, task });
        info!("Hub opened {}", session_id);

        Ok(Link {
            session_id,
            outgoing: client_tx,
            incoming: client_rx,
        })
    }
}
