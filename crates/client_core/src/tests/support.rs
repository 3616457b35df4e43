//! In-process fakes for the engine's collaborators.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conversation_transport::channel_name_for;
use shared::{
    domain::{
        direct_local_key, ChatMessage, ConversationId, ConversationKey, ConversationKind,
        DeliveryStatus, MessageId, ReadReceipt, UserId,
    },
    protocol::{AppendOutcome, ConversationSummary, ParticipantSummary, TransportTokenResponse},
};
use tokio::sync::mpsc;

use crate::{
    error::SyncError,
    gateway::PersistenceGateway,
    hub::{HubConnection, HubConnector, HubFrame},
};

#[derive(Default)]
pub(crate) struct GatewayState {
    pub conversations: Vec<ConversationSummary>,
    pub messages: HashMap<ConversationId, Vec<ChatMessage>>,
    pub receipts: HashMap<MessageId, Vec<ReadReceipt>>,
    pub reads: Vec<(Vec<MessageId>, Option<ConversationId>)>,
    pub typing: Vec<(ConversationId, bool)>,
    pub append_calls: usize,
    pub open_direct_calls: usize,
    pub list_calls: usize,
    /// Appends that fail before the gateway starts accepting again.
    pub failing_appends: usize,
    pub offline: bool,
    next_conversation_id: i64,
}

/// Gateway that keeps everything in memory and can be told to fail.
pub(crate) struct FakeGateway {
    me: UserId,
    pub state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new(me: UserId) -> Arc<Self> {
        Arc::new(Self {
            me,
            state: Mutex::new(GatewayState {
                next_conversation_id: 100,
                ..GatewayState::default()
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut GatewayState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Registers a direct conversation between the gateway's user and
    /// `peer` as if the server already had it.
    pub fn seed_direct(&self, peer: UserId) -> ConversationSummary {
        self.with(|state| direct_summary(state, self.me, peer))
    }

    /// Stores a message as the server would after another user sent it.
    pub fn seed_message(&self, conversation_id: ConversationId, message: ChatMessage) {
        self.with(|state| {
            state
                .messages
                .entry(conversation_id)
                .or_default()
                .push(persisted(conversation_id, &message))
        });
    }

    pub fn stored_ids(&self, conversation_id: ConversationId) -> Vec<MessageId> {
        self.with(|state| {
            state
                .messages
                .get(&conversation_id)
                .map(|list| list.iter().map(|m| m.id.clone()).collect())
                .unwrap_or_default()
        })
    }
}

fn direct_summary(state: &mut GatewayState, me: UserId, peer: UserId) -> ConversationSummary {
    let local_key = direct_local_key(me, peer);
    if let Some(existing) = state.conversations.iter().find(|c| c.local_key == local_key) {
        return existing.clone();
    }
    state.next_conversation_id += 1;
    let summary = ConversationSummary {
        conversation_id: ConversationId(state.next_conversation_id),
        local_key,
        kind: ConversationKind::Direct,
        name: None,
        participants: vec![
            ParticipantSummary {
                user_id: me,
                username: format!("user{}", me.0),
            },
            ParticipantSummary {
                user_id: peer,
                username: format!("user{}", peer.0),
            },
        ],
    };
    state.conversations.push(summary.clone());
    summary
}

fn persisted(conversation_id: ConversationId, message: &ChatMessage) -> ChatMessage {
    ChatMessage {
        conversation: ConversationKey::Persisted(conversation_id),
        status: DeliveryStatus::Sent,
        ..message.clone()
    }
}

fn offline() -> SyncError {
    SyncError::Persistence("gateway offline".into())
}

#[async_trait]
impl PersistenceGateway for FakeGateway {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        message: &ChatMessage,
    ) -> Result<AppendOutcome, SyncError> {
        self.with(|state| {
            state.append_calls += 1;
            if state.offline {
                return Err(offline());
            }
            if state.failing_appends > 0 {
                state.failing_appends -= 1;
                return Err(SyncError::Persistence("append rejected".into()));
            }
            let list = state.messages.entry(conversation_id).or_default();
            if list.iter().any(|m| m.id == message.id) {
                return Ok(AppendOutcome::AlreadyExists);
            }
            list.push(persisted(conversation_id, message));
            Ok(AppendOutcome::Inserted)
        })
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, SyncError> {
        self.with(|state| {
            state.list_calls += 1;
            if state.offline {
                return Err(offline());
            }
            let mut list: Vec<ChatMessage> = state
                .messages
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|m| before.map_or(true, |b| m.timestamp < b))
                .collect();
            list.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
            let skip = list.len().saturating_sub(limit as usize);
            Ok(list.split_off(skip))
        })
    }

    async fn record_reads(
        &self,
        message_ids: &[MessageId],
        conversation_id: Option<ConversationId>,
    ) -> Result<u64, SyncError> {
        self.with(|state| {
            if state.offline {
                return Err(offline());
            }
            state.reads.push((message_ids.to_vec(), conversation_id));
            Ok(message_ids.len() as u64)
        })
    }

    async fn get_receipts(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<ReadReceipt>>, SyncError> {
        self.with(|state| {
            if state.offline {
                return Err(offline());
            }
            Ok(message_ids
                .iter()
                .filter_map(|id| state.receipts.get(id).map(|r| (id.clone(), r.clone())))
                .collect())
        })
    }

    async fn open_direct_conversation(
        &self,
        other_user_id: UserId,
    ) -> Result<ConversationSummary, SyncError> {
        let me = self.me;
        self.with(|state| {
            state.open_direct_calls += 1;
            if state.offline {
                return Err(offline());
            }
            Ok(direct_summary(state, me, other_user_id))
        })
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
        self.with(|state| {
            if state.offline {
                return Err(offline());
            }
            Ok(state.conversations.clone())
        })
    }

    async fn send_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), SyncError> {
        self.with(|state| {
            state.typing.push((conversation_id, is_typing));
            Ok(())
        })
    }

    async fn channel_token(
        &self,
        conversation_id: ConversationId,
    ) -> Result<TransportTokenResponse, SyncError> {
        self.with(|state| {
            let summary = state
                .conversations
                .iter()
                .find(|c| c.conversation_id == conversation_id)
                .ok_or_else(|| SyncError::UnknownConversation(conversation_id.to_string()))?;
            Ok(TransportTokenResponse {
                channel_name: channel_name_for(&summary.local_key),
                token: format!("token-{}", conversation_id.0),
            })
        })
    }
}

/// Hub whose frames are pushed by the test. Connects succeed while
/// `online` is set.
pub(crate) struct FakeHub {
    online: Mutex<bool>,
    feed: Mutex<Option<mpsc::UnboundedReceiver<HubFrame>>>,
    sender: mpsc::UnboundedSender<HubFrame>,
}

impl FakeHub {
    pub fn new(online: bool) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            online: Mutex::new(online),
            feed: Mutex::new(Some(receiver)),
            sender,
        })
    }

    pub fn push(&self, frame: HubFrame) {
        let _ = self.sender.send(frame);
    }
}

struct FeedConnection {
    feed: mpsc::UnboundedReceiver<HubFrame>,
}

#[async_trait]
impl HubConnection for FeedConnection {
    async fn next_frame(&mut self) -> HubFrame {
        match self.feed.recv().await {
            Some(frame) => frame,
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl HubConnector for FakeHub {
    async fn connect(&self) -> Result<Box<dyn HubConnection>, SyncError> {
        if !*self.online.lock().unwrap() {
            return Err(SyncError::Transport("hub down".into()));
        }
        match self.feed.lock().unwrap().take() {
            Some(feed) => Ok(Box::new(FeedConnection { feed })),
            None => Err(SyncError::Transport("hub feed already taken".into())),
        }
    }
}
