use std::{fmt, str::FromStr};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);

/// Client-generated message identity. Two copies carrying the same id are
/// the same message no matter which path delivered them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown conversation kind '{other}'")),
        }
    }
}

/// Either identifier a conversation is known by.
///
/// The local key exists before any server round trip; the persisted key is
/// assigned by the server once the conversation is first stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConversationKey {
    Local(String),
    Persisted(ConversationId),
}

impl ConversationKey {
    pub fn direct(a: UserId, b: UserId) -> Self {
        Self::Local(direct_local_key(a, b))
    }

    pub fn local(key: impl Into<String>) -> Self {
        Self::Local(key.into())
    }

    pub fn local_key(&self) -> Option<&str> {
        match self {
            Self::Local(key) => Some(key),
            Self::Persisted(_) => None,
        }
    }

    pub fn persisted_id(&self) -> Option<ConversationId> {
        match self {
            Self::Local(_) => None,
            Self::Persisted(id) => Some(*id),
        }
    }

    /// Peer of a direct conversation, if this is a direct local key that
    /// includes `me`.
    pub fn direct_peer(&self, me: UserId) -> Option<UserId> {
        let rest = self.local_key()?.strip_prefix("direct-")?;
        let (low, high) = rest.split_once('-')?;
        let low = UserId(low.parse().ok()?);
        let high = UserId(high.parse().ok()?);
        if low == me {
            Some(high)
        } else if high == me {
            Some(low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(key) => f.write_str(key),
            Self::Persisted(id) => write!(f, "conversation:{}", id.0),
        }
    }
}

impl From<ConversationId> for ConversationKey {
    fn from(value: ConversationId) -> Self {
        Self::Persisted(value)
    }
}

pub fn direct_local_key(a: UserId, b: UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("direct-{}-{}", low.0, high.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "file" => Ok(Self::File),
            other => Err(format!("unknown message kind '{other}'")),
        }
    }
}

/// Authoritative lifecycle of a message as seen by its sender.
///
/// Merging two observations keeps the dominant one, ranked
/// `sending < failed < sent < read`. The only way back down is an explicit
/// retry, which is not a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Failed => 1,
            Self::Sent => 2,
            Self::Read => 3,
        }
    }

    pub fn merge(self, incoming: Self) -> Self {
        if incoming.rank() > self.rank() {
            incoming
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation: ConversationKey,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl ChatMessage {
    /// A fresh locally originated text message in the `sending` state.
    pub fn outgoing(
        conversation: ConversationKey,
        sender_id: UserId,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation,
            sender_id,
            sender_name: sender_name.into(),
            content: content.into(),
            kind: MessageKind::Text,
            // storage keeps millisecond precision
            timestamp: Utc::now().trunc_subsecs(3),
            status: DeliveryStatus::Sending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub reader_id: UserId,
    pub reader_name: String,
    pub read_at: DateTime<Utc>,
}
