use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use conversation_transport::ChannelSession;
use shared::{
    domain::{ChatMessage, ConversationId, ConversationKey, DeliveryStatus, MessageId, UserId},
    protocol::{AppendOutcome, ChannelFrame},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{info, warn};

use crate::{error::SyncError, gateway::PersistenceGateway, state::SyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    Sending,
    Sent,
    ProbablyDelivered,
    Read,
    Failed,
}

pub fn display_status(
    message: &ChatMessage,
    now: DateTime<Utc>,
    delivered_hint_after: Duration,
) -> DisplayStatus {
    match message.status {
        DeliveryStatus::Sending => DisplayStatus::Sending,
        DeliveryStatus::Failed => DisplayStatus::Failed,
        DeliveryStatus::Read => DisplayStatus::Read,
        DeliveryStatus::Sent => {
            let age = now.signed_duration_since(message.timestamp);
            match age.to_std() {
                Ok(age) if age >= delivered_hint_after => DisplayStatus::ProbablyDelivered,
                _ => DisplayStatus::Sent,
            }
        }
    }
}

pub struct PendingSend {
    pub message: ChatMessage,
    completion: JoinHandle<Result<AppendOutcome, SyncError>>,
}

impl PendingSend {
    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    pub async fn outcome(self) -> Result<AppendOutcome, SyncError> {
        self.completion
            .await
            .map_err(|e| SyncError::Transport(format!("delivery task ended: {e}")))?
    }
}

pub(crate) struct DeliveryStateMachine {
    state: Arc<SyncState>,
    gateway: Arc<dyn PersistenceGateway>,
    resolving: Mutex<()>,
}

impl DeliveryStateMachine {
    pub(crate) fn new(state: Arc<SyncState>, gateway: Arc<dyn PersistenceGateway>) -> Arc<Self> {
        Arc::new(Self {
            state,
            gateway,
            resolving: Mutex::new(()),
        })
    }

    pub(crate) fn send(
        self: &Arc<Self>,
        key: &ConversationKey,
        content: &str,
        session: Option<Arc<dyn ChannelSession>>,
    ) -> PendingSend {
        let me = &self.state.me;
        let message = ChatMessage::outgoing(key.clone(), me.user_id, me.username.clone(), content);
        self.state.upsert(key, message.clone());
        info!(conversation = %key, message_id = %message.id, "delivery: sending");
        self.spawn_delivery(message, session)
    }

    pub(crate) fn retry(
        self: &Arc<Self>,
        id: &MessageId,
        session: Option<Arc<dyn ChannelSession>>,
    ) -> Result<PendingSend, SyncError> {
        let message = self
            .state
            .reset_for_retry(id)
            .ok_or_else(|| SyncError::NotRetryable(id.clone()))?;
        info!(message_id = %id, "delivery: retrying");
        Ok(self.spawn_delivery(message, session))
    }

    fn spawn_delivery(
        self: &Arc<Self>,
        message: ChatMessage,
        session: Option<Arc<dyn ChannelSession>>,
    ) -> PendingSend {
        let machine = Arc::clone(self);
        let pending = message.clone();
        let completion = tokio::spawn(async move { machine.deliver(message, session).await });
        PendingSend {
            message: pending,
            completion,
        }
    }

    async fn deliver(
        &self,
        message: ChatMessage,
        session: Option<Arc<dyn ChannelSession>>,
    ) -> Result<AppendOutcome, SyncError> {
        let result = self.persist(&message, session).await;
        match &result {
            Ok(outcome) => {
                self.state.apply_status(&message.id, DeliveryStatus::Sent);
                info!(message_id = %message.id, ?outcome, "delivery: sent");
            }
            Err(error) => {
                self.state.apply_status(&message.id, DeliveryStatus::Failed);
                warn!(message_id = %message.id, %error, "delivery: failed");
            }
        }
        result
    }

    async fn persist(
        &self,
        message: &ChatMessage,
        session: Option<Arc<dyn ChannelSession>>,
    ) -> Result<AppendOutcome, SyncError> {
        let conversation_id = self.resolve_persisted(&message.conversation).await?;

        if let Some(session) = session {
            match (ChannelFrame::Message {
                message: message.clone(),
            })
            .encode()
            {
                Ok(payload) => {
                    if let Err(error) = session.publish(payload).await {
                        warn!(message_id = %message.id, %error, "delivery: transport publish failed");
                    }
                }
                Err(error) => warn!(%error, "delivery: frame encode failed"),
            }
        }

        self.gateway
            .append_message(conversation_id, message)
            .await
    }

    pub(crate) async fn resolve_persisted(
        &self,
        key: &ConversationKey,
    ) -> Result<ConversationId, SyncError> {
        let linked = self.state.cache().linked_persisted(key);
        if let Some(id) = linked {
            return Ok(id);
        }
        let _guard = self.resolving.lock().await;
        let linked = self.state.cache().linked_persisted(key);
        if let Some(id) = linked {
            return Ok(id);
        }
        let peer = key
            .direct_peer(self.state.me.user_id)
            .ok_or_else(|| SyncError::UnknownConversation(key.to_string()))?;
        let summary = self.gateway.open_direct_conversation(peer).await?;
        let persisted = ConversationKey::Persisted(summary.conversation_id);
        self.state
            .link_keys(&ConversationKey::local(summary.local_key), &persisted);
        self.state.link_keys(key, &persisted);
        Ok(summary.conversation_id)
    }

    pub(crate) fn apply_messages_read(&self, message_ids: &[MessageId], reader_id: UserId) -> usize {
        if reader_id == self.state.me.user_id {
            return 0;
        }
        message_ids
            .iter()
            .filter(|id| self.is_own(id))
            .filter(|id| self.state.apply_status(id, DeliveryStatus::Read).is_some())
            .count()
    }

    fn is_own(&self, id: &MessageId) -> bool {
        self.state
            .cache()
            .find(id)
            .is_some_and(|m| m.sender_id == self.state.me.user_id)
    }

    pub(crate) async fn refresh_receipts(&self, key: &ConversationKey) -> Result<usize, SyncError> {
        let me = self.state.me.user_id;
        let pending: Vec<MessageId> = self
            .state
            .cache()
            .get(key)
            .into_iter()
            .filter(|m| m.sender_id == me && m.status == DeliveryStatus::Sent)
            .map(|m| m.id)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let receipts = self.gateway.get_receipts(&pending).await?;
        let mut promoted = 0;
        for (id, readers) in receipts {
            if readers.iter().any(|r| r.reader_id != me)
                && self.state.apply_status(&id, DeliveryStatus::Read).is_some()
            {
                promoted += 1;
            }
        }
        Ok(promoted)
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
