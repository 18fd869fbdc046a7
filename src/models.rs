use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of a consultation an actor sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Doctor,
    Patient,
}

/// The local participant a session acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub display_name: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn doctor(id: &str, display_name: &str) -> Self {
        Actor {
            id: id.to_string(),
            display_name: display_name.to_string(),
            role: ActorRole::Doctor,
        }
    }

    pub fn patient(id: &str, display_name: &str) -> Self {
        Actor {
            id: id.to_string(),
            display_name: display_name.to_string(),
            role: ActorRole::Patient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsultationStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl ConsultationStatus {
    /// Legal lifecycle moves. COMPLETED and CANCELLED are terminal.
    pub fn can_transition_to(self, next: ConsultationStatus) -> bool {
        use ConsultationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, InProgress)
                | (InProgress, Completed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConsultationStatus::Completed | ConsultationStatus::Cancelled)
    }
}

/// Read-only snapshot handed out by the consultation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consultation {
    pub id: String,
    pub status: ConsultationStatus,
    pub doctor_id: String,
    pub patient_id: String,
    pub schedule: Option<DateTime<Utc>>,
}

/// A chat message as it travels on the wire and sits in the local sequence.
///
/// `id` is assigned by the far end; the sender's optimistic copy has none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub consultation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message composed locally, not yet accepted by the far end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub consultation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    pub fn new(consultation_id: &str, sender_id: &str, content: &str) -> Self {
        OutgoingMessage {
            consultation_id: consultation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Typing signal payload: `{ consultationId, username }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub consultation_id: String,
    pub username: String,
}

/// What a typing handler is told: a peer started typing, or their indicator expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUpdate {
    pub consultation_id: String,
    pub username: String,
    pub is_typing: bool,
}

/// Outcome of a successful `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The far end stored the message and returned its stamped copy.
    Acknowledged(ChatMessage),
    /// The transport was down; the message waits on the outbound queue.
    Queued { request_id: String },
}
