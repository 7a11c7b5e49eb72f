use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ProtocolError};
use crate::types::{
    base64_bytes, ConversationId, MediaConstraints, Message, MessageId, Nonce, PublicKey, UserId,
};

/// Everything a client may send over the socket.
///
/// JSON shape: `{"event": "send_message", "conversationId": 1, ...}`.
/// Signaling payloads (offer, answer, candidate) are opaque and relayed as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Authenticate {
        user_id: UserId,
    },
    PublishKey {
        public_key: PublicKey,
    },
    GetPublicKey {
        user_id: UserId,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        #[serde(with = "base64_bytes")]
        ciphertext: Vec<u8>,
        nonce: Nonce,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    MarkAsDelivered {
        message_id: MessageId,
    },
    MarkAsRead {
        message_id: MessageId,
    },
    LoadHistory {
        conversation_id: ConversationId,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        before_message_id: Option<MessageId>,
    },
    CallInitiate {
        to_user_id: UserId,
        media: MediaConstraints,
        #[serde(default)]
        offer: Value,
    },
    CallAccept {
        to_user_id: UserId,
        #[serde(default)]
        answer: Value,
    },
    CallReject {
        to_user_id: UserId,
        #[serde(default)]
        reason: Option<String>,
    },
    CallIce {
        to_user_id: UserId,
        candidate: Value,
    },
    CallEnd {
        to_user_id: UserId,
    },
    CallFailed {
        to_user_id: UserId,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ClientEvent {
    /// Validate a raw text frame. Unknown event names and missing or
    /// mistyped fields are rejected here, before dispatch.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate { .. } => "authenticate",
            ClientEvent::PublishKey { .. } => "publish_key",
            ClientEvent::GetPublicKey { .. } => "get_public_key",
            ClientEvent::JoinConversation { .. } => "join_conversation",
            ClientEvent::LeaveConversation { .. } => "leave_conversation",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::MarkAsDelivered { .. } => "mark_as_delivered",
            ClientEvent::MarkAsRead { .. } => "mark_as_read",
            ClientEvent::LoadHistory { .. } => "load_history",
            ClientEvent::CallInitiate { .. } => "call_initiate",
            ClientEvent::CallAccept { .. } => "call_accept",
            ClientEvent::CallReject { .. } => "call_reject",
            ClientEvent::CallIce { .. } => "call_ice",
            ClientEvent::CallEnd { .. } => "call_end",
            ClientEvent::CallFailed { .. } => "call_failed",
        }
    }
}

/// Everything the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    PresenceSnapshot {
        online_user_ids: Vec<UserId>,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    JoinedConversation {
        conversation_id: ConversationId,
    },
    NewMessage(Message),
    MessageDelivered {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    History {
        conversation_id: ConversationId,
        /// Oldest first.
        messages: Vec<Message>,
        has_more: bool,
    },
    #[serde(rename = "public_key")]
    PublicKeyResolved {
        user_id: UserId,
        public_key: Option<PublicKey>,
    },
    IncomingCall {
        from_user_id: UserId,
        offer: Value,
        media: MediaConstraints,
    },
    CallAnswer {
        from_user_id: UserId,
        answer: Value,
    },
    IceCandidate {
        from_user_id: UserId,
        candidate: Value,
    },
    CallEnded {
        from_user_id: UserId,
        reason: Option<String>,
    },
    CallRejected {
        from_user_id: UserId,
        reason: Option<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryState;
    use serde_json::json;

    #[test]
    fn test_parse_send_message() {
        let text = json!({
            "event": "send_message",
            "conversationId": 7,
            "ciphertext": "AAECAw==",
            "nonce": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
        })
        .to_string();

        let event = ClientEvent::parse(&text).unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                conversation_id: ConversationId(7),
                ciphertext: vec![0, 1, 2, 3],
                nonce: Nonce([0u8; 24]),
            }
        );
    }

    #[test]
    fn test_parse_call_initiate_keeps_offer_opaque() {
        let text = json!({
            "event": "call_initiate",
            "toUserId": 2,
            "media": { "audio": true, "video": false },
            "offer": { "type": "offer", "sdp": "v=0..." },
        })
        .to_string();

        match ClientEvent::parse(&text).unwrap() {
            ClientEvent::CallInitiate {
                to_user_id,
                media,
                offer,
            } => {
                assert_eq!(to_user_id, UserId(2));
                assert_eq!(media, MediaConstraints::audio_only());
                assert_eq!(offer["sdp"], "v=0...");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_malformed() {
        let err = ClientEvent::parse(r#"{"event":"drop_tables"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let err = ClientEvent::parse(r#"{"event":"join_conversation"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_bad_nonce_length_is_malformed() {
        let text = json!({
            "event": "send_message",
            "conversationId": 1,
            "ciphertext": "AAEC",
            "nonce": "AAEC",
        })
        .to_string();
        assert!(ClientEvent::parse(&text).is_err());
    }

    #[test]
    fn test_new_message_is_flat() {
        let event = ServerEvent::NewMessage(Message {
            id: MessageId(10),
            conversation_id: ConversationId(3),
            sender_id: UserId(1),
            ciphertext: vec![9, 9],
            nonce: Nonce([1u8; 24]),
            created_at: chrono::Utc::now(),
            delivery_state: DeliveryState::Sent,
        });

        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "new_message");
        assert_eq!(value["id"], 10);
        assert_eq!(value["conversationId"], 3);
        assert_eq!(value["deliveryState"], "sent");
    }

    #[test]
    fn test_error_event_shape() {
        let value: Value = serde_json::from_str(
            &ServerEvent::error(ErrorCode::AccessDenied, "not a participant")
                .to_json()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["code"], "access_denied");
    }
}
