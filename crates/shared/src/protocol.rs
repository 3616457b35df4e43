use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{
    ChatMessage, ConversationId, ConversationKind, MessageId, MessageKind, ReadReceipt, UserId,
};

/// Envelope pushed over the notification hub, one per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected {
        user_id: UserId,
    },
    NewMessage {
        conversation_id: ConversationId,
        local_key: String,
        message: ChatMessage,
    },
    MessagesRead {
        message_ids: Vec<MessageId>,
        reader_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    Typing {
        conversation_id: ConversationId,
        local_key: String,
        user_id: UserId,
        user_name: String,
        is_typing: bool,
    },
}

const SERVER_EVENT_KINDS: &[&str] = &["connected", "new-message", "messages-read", "typing"];

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::NewMessage { .. } => "new-message",
            Self::MessagesRead { .. } => "messages-read",
            Self::Typing { .. } => "typing",
        }
    }

    /// Decodes one hub frame. Frames of a kind this build does not know
    /// decode to `Ok(None)` so newer servers never break older clients.
    pub fn decode(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        if !SERVER_EVENT_KINDS.contains(&raw.kind.as_str()) {
            return Ok(None);
        }
        serde_json::from_str(text).map(Some)
    }
}

/// Payload published on a per-conversation transport channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelFrame {
    Message {
        message: ChatMessage,
    },
    Typing {
        user_id: UserId,
        user_name: String,
        is_typing: bool,
    },
}

impl ChannelFrame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub local_key: String,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub participants: Vec<ParticipantSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDirectConversationRequest {
    pub other_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupConversationRequest {
    pub local_key: String,
    pub name: String,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Millisecond unix timestamp; only strictly older messages are returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendMessageRequest {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendMessageResponse {
    pub outcome: AppendOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub message_ids: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub read_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptsRequest {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptsResponse {
    pub receipts: HashMap<MessageId, Vec<ReadReceipt>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRequest {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportTokenRequest {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportTokenResponse {
    pub channel_name: String,
    pub token: String,
}
