// Wire frames exchanged with the far end.
// Frames are JSON text objects tagged by "type"; payload fields are camelCase.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ChatMessage, OutgoingMessage, TypingSignal};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    // client -> far end
    #[serde(rename_all = "camelCase")]
    Join { consultation_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    Leave { consultation_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    Send { request_id: String, message: OutgoingMessage },
    Heartbeat,

    // far end -> client
    Message { message: ChatMessage },
    #[serde(rename_all = "camelCase")]
    History { consultation_id: String, messages: Vec<ChatMessage> },
    #[serde(rename_all = "camelCase")]
    Ack { request_id: String, message: ChatMessage },
    #[serde(rename_all = "camelCase")]
    Rejected { request_id: String, reason: String },
    HeartbeatAck,

    // both directions
    Typing { signal: TypingSignal },
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Join { .. } => "join",
            Frame::Leave { .. } => "leave",
            Frame::Send { .. } => "send",
            Frame::Heartbeat => "heartbeat",
            Frame::Message { .. } => "message",
            Frame::History { .. } => "history",
            Frame::Ack { .. } => "ack",
            Frame::Rejected { .. } => "rejected",
            Frame::HeartbeatAck => "heartbeatAck",
            Frame::Typing { .. } => "typing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_message_frame_uses_wire_field_names() {
        let frame = Frame::Message {
            message: ChatMessage {
                id: Some("m1".to_string()),
                consultation_id: "c1".to_string(),
                sender_id: "p1".to_string(),
                content: "Hello".to_string(),
                created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            },
        };
        let text = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "message");
        assert_eq!(value["message"]["consultationId"], "c1");
        assert_eq!(value["message"]["senderId"], "p1");
        assert_eq!(value["message"]["createdAt"], "2024-05-01T09:00:00Z");
    }

    #[test]
    fn test_optimistic_copy_omits_id() {
        let text = r#"{"type":"message","message":{"consultationId":"c1","senderId":"p1","content":"hi","createdAt":"2024-05-01T09:00:00Z"}}"#;
        match Frame::decode(text).unwrap() {
            Frame::Message { message } => assert_eq!(message.id, None),
            other => panic!("Expected message frame, got {:?}", other),
        }
    }

    #[test]
    fn test_typing_and_heartbeat_frames() {
        let typing = Frame::decode(r#"{"type":"typing","signal":{"consultationId":"c1","username":"Dr. Ada"}}"#).unwrap();
        assert_eq!(typing.kind(), "typing");
        assert_eq!(Frame::decode(r#"{"type":"heartbeatAck"}"#).unwrap(), Frame::HeartbeatAck);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Frame::decode("<presence/>").is_err());
        assert!(Frame::decode(r#"{"type":"teleport"}"#).is_err());
    }
}
