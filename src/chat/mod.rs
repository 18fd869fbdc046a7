// Consultation chat client module.
// Entry point for the real-time messaging core: the session object handed to
// each chat screen, and the error taxonomy shared by its submodules.

use log::info;
use std::sync::Arc;
use thiserror::Error;

pub mod access;
pub mod channel;
pub mod chat_states;
pub mod connection;
pub mod directory;
pub mod dispatch;
pub mod memory;
pub(crate) mod outbound_queue;
pub mod protocol;
pub mod transport;

pub use access::{AccessError, RoomMode};
pub use channel::{MessageChannel, MessageLog};
pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionStatus, FlushReport, Ready};
pub use directory::{ConsultationDirectory, InMemoryDirectory, TransitionError};
pub use dispatch::SubscriptionHandle;
pub use memory::MemoryHub;
pub use transport::{Link, Transport, TransportError};

use crate::config::ChatConfig;
use crate::models::{Actor, Consultation};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Connection timed out on all {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("Failed to connect after {attempts} attempt(s): {reason}")]
    Exhausted { attempts: u32, reason: String },
    #[error("Session was closed while connecting")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("No acknowledgement for message {0} in time")]
    Timeout(String),
    #[error("Outbound queue is full ({0} messages)")]
    QueueFull(usize),
    #[error("Not connected")]
    NotConnected,
    #[error("Message rejected by far end: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("Channel for consultation {0} is closed")]
    ChannelClosed(String),
    #[error(transparent)]
    Directory(#[from] anyhow::Error),
}

/// Fresh consultation snapshot; an unknown consultation is treated as unauthorized.
pub(crate) async fn fetch_consultation(
    directory: &dyn ConsultationDirectory,
    consultation_id: &str,
    actor: &Actor,
) -> Result<Consultation, ChatError> {
    match directory.get_consultation(consultation_id).await? {
        Some(consultation) => Ok(consultation),
        None => Err(AccessError::Unauthorized {
            consultation: consultation_id.to_string(),
            actor: actor.id.clone(),
        }
        .into()),
    }
}

/// One actor's chat session: owns the connection, hands out room channels.
///
/// Pass it by reference to each chat screen; dropping it tears everything down.
pub struct ChatSession {
    actor: Actor,
    directory: Arc<dyn ConsultationDirectory>,
    connection: ConnectionManager,
}

impl ChatSession {
    pub fn new(
        actor: Actor,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn ConsultationDirectory>,
        config: ChatConfig,
    ) -> Self {
        let connection = ConnectionManager::new(transport, config, &actor.id);
        ChatSession {
            actor,
            directory,
            connection,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub async fn connect(&self) -> Result<Ready, ConnectError> {
        self.connection.connect().await
    }

    pub async fn reconnect(&self) -> Result<Ready, ConnectError> {
        self.connection.reconnect().await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Join a consultation room.
    ///
    /// Access is evaluated against a fresh snapshot on every call. Connects
    /// first when the transport is down and surfaces the connect failure.
    pub async fn join(&self, consultation_id: &str, mode: RoomMode) -> Result<MessageChannel, ChatError> {
        let consultation = fetch_consultation(self.directory.as_ref(), consultation_id, &self.actor).await?;
        let granted = access::evaluate_join(&consultation, &self.actor, mode)?;

        if !self.connection.is_connected() {
            self.connection.connect().await?;
        }
        Ok(MessageChannel::open(
            consultation_id,
            granted,
            self.actor.clone(),
            self.directory.clone(),
            self.connection.clone(),
        ))
    }

    /// Unbind every channel of a consultation. Idempotent.
    pub fn leave(&self, consultation_id: &str) -> bool {
        let closed = self.connection.dispatcher().unregister_room(consultation_id);
        if closed == 0 {
            return false;
        }
        let leave = protocol::Frame::Leave {
            consultation_id: consultation_id.to_string(),
            user_id: self.actor.id.clone(),
        };
        self.connection.try_write_frame(&leave);
        info!("{} left {} ({} channel(s) closed)", self.actor.id, consultation_id, closed);
        true
    }

    /// Best-effort typing signal. Callers debounce (about one call per 500 ms of input).
    pub fn emit_typing(&self, consultation_id: &str, display_name: &str) -> bool {
        self.connection.emit_typing(consultation_id, display_name)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
