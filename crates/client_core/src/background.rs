use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use conversation_transport::{
    parse_participant_identity, ChannelConnector, ChannelEvent, ChannelJoin, ChannelSession,
};
use shared::{
    domain::{ChatMessage, ConversationId, ConversationKey, DeliveryStatus},
    protocol::{ChannelFrame, ConversationSummary},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{error::SyncError, gateway::PersistenceGateway, state::SyncState};

struct BackgroundSubscription {
    session: Arc<dyn ChannelSession>,
    task: JoinHandle<()>,
    live: Arc<AtomicBool>,
}

impl BackgroundSubscription {
    fn detach(self) -> Arc<dyn ChannelSession> {
        self.live.store(false, Ordering::SeqCst);
        self.task.abort();
        self.session
    }
}

pub(crate) struct BackgroundConnectionManager {
    state: Arc<SyncState>,
    gateway: Arc<dyn PersistenceGateway>,
    connector: Arc<dyn ChannelConnector>,
    max_subscriptions: usize,
    subscriptions: Mutex<HashMap<ConversationKey, BackgroundSubscription>>,
    reconciling: tokio::sync::Mutex<()>,
}

impl BackgroundConnectionManager {
    pub(crate) fn new(
        state: Arc<SyncState>,
        gateway: Arc<dyn PersistenceGateway>,
        connector: Arc<dyn ChannelConnector>,
        max_subscriptions: usize,
    ) -> Self {
        Self {
            state,
            gateway,
            connector,
            max_subscriptions,
            subscriptions: Mutex::new(HashMap::new()),
            reconciling: tokio::sync::Mutex::new(()),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<ConversationKey, BackgroundSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_subscribed(&self, key: &ConversationKey) -> bool {
        let key = self.state.canonical(key);
        self.subscriptions().contains_key(&key)
    }

    pub(crate) fn subscribed(&self) -> Vec<ConversationKey> {
        self.subscriptions().keys().cloned().collect()
    }

    pub(crate) fn detach(&self, key: &ConversationKey) -> Option<Arc<dyn ChannelSession>> {
        let key = self.state.canonical(key);
        let subscription = self.subscriptions().remove(&key)?;
        info!(conversation = %key, "background: unsubscribed");
        Some(subscription.detach())
    }

    pub(crate) async fn shutdown(&self) {
        let detached: Vec<_> = self
            .subscriptions()
            .drain()
            .map(|(_, subscription)| subscription.detach())
            .collect();
        leave_all(detached).await;
    }

    pub(crate) async fn reconcile(&self, known: &[ConversationSummary]) -> usize {
        let _pass = self.reconciling.lock().await;

        let mut wanted: Vec<(ConversationKey, ConversationId)> = Vec::new();
        for summary in known {
            let local = ConversationKey::local(summary.local_key.clone());
            self.state
                .link_keys(&local, &ConversationKey::Persisted(summary.conversation_id));
            let key = self.state.canonical(&local);
            if !self.state.is_foreground(&key) && !wanted.iter().any(|(k, _)| k == &key) {
                wanted.push((key, summary.conversation_id));
            }
        }

        let stale: Vec<Arc<dyn ChannelSession>> = {
            let mut subscriptions = self.subscriptions();
            let keys: Vec<ConversationKey> = subscriptions
                .keys()
                .filter(|key| !wanted.iter().any(|(k, _)| k == *key))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    info!(conversation = %key, "background: unsubscribed");
                    subscriptions.remove(&key).map(BackgroundSubscription::detach)
                })
                .collect()
        };
        leave_all(stale).await;

        let missing: Vec<(ConversationKey, ConversationId)> = {
            let subscriptions = self.subscriptions();
            wanted
                .into_iter()
                .filter(|(key, _)| !subscriptions.contains_key(key))
                .collect()
        };

        let mut opened = 0;
        for (key, conversation_id) in missing {
            if self.subscriptions().len() >= self.max_subscriptions {
                debug!(
                    limit = self.max_subscriptions,
                    "background: subscription limit reached"
                );
                break;
            }
            match self.subscribe(&key, conversation_id).await {
                Ok(subscription) => {
                    let rejected = {
                        let mut subscriptions = self.subscriptions();
                        if self.state.is_foreground(&key) || subscriptions.contains_key(&key) {
                            Some(subscription.detach())
                        } else {
                            subscriptions.insert(key.clone(), subscription);
                            None
                        }
                    };
                    match rejected {
                        Some(session) => leave_all(vec![session]).await,
                        None => {
                            info!(conversation = %key, "background: subscribed");
                            opened += 1;
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        conversation = %key,
                        %error,
                        "background: subscribe failed, retrying on next pass"
                    );
                }
            }
        }
        opened
    }

    async fn subscribe(
        &self,
        key: &ConversationKey,
        conversation_id: ConversationId,
    ) -> Result<BackgroundSubscription, SyncError> {
        let session = join_channel(
            self.gateway.as_ref(),
            self.connector.as_ref(),
            conversation_id,
        )
        .await?;
        let live = Arc::new(AtomicBool::new(true));
        let state = Arc::clone(&self.state);
        let conversation = key.clone();
        let task = tokio::spawn(pump_channel(
            session.subscribe_events(),
            Arc::clone(&live),
            move |frame| match frame {
                ChannelFrame::Message { message } => {
                    state.apply_incoming(&conversation, received(message));
                }
                ChannelFrame::Typing { .. } => {}
            },
        ));
        Ok(BackgroundSubscription {
            session,
            task,
            live,
        })
    }
}

pub(crate) async fn join_channel(
    gateway: &dyn PersistenceGateway,
    connector: &dyn ChannelConnector,
    conversation_id: ConversationId,
) -> Result<Arc<dyn ChannelSession>, SyncError> {
    let grant = gateway.channel_token(conversation_id).await?;
    connector
        .connect(ChannelJoin {
            channel_name: grant.channel_name,
            token: grant.token,
        })
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))
}

pub(crate) async fn leave_all(sessions: Vec<Arc<dyn ChannelSession>>) {
    for session in sessions {
        if let Err(error) = session.leave().await {
            warn!(channel = session.channel_name(), %error, "transport: leave failed");
        }
    }
}

// frames whose claimed sender is not the transport identity are dropped
pub(crate) async fn pump_channel(
    mut events: broadcast::Receiver<ChannelEvent>,
    live: Arc<AtomicBool>,
    on_frame: impl Fn(ChannelFrame) + Send + 'static,
) {
    loop {
        let inbound = match events.recv().await {
            Ok(ChannelEvent::Data(inbound)) => inbound,
            Ok(ChannelEvent::Disconnected) | Err(broadcast::error::RecvError::Closed) => {
                debug!("transport: channel closed");
                return;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "transport: channel lagged");
                continue;
            }
        };
        if !live.load(Ordering::SeqCst) {
            return;
        }
        let frame = match ChannelFrame::decode(&inbound.payload) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "transport: malformed frame");
                continue;
            }
        };
        let claimed = match &frame {
            ChannelFrame::Message { message } => message.sender_id,
            ChannelFrame::Typing { user_id, .. } => *user_id,
        };
        if parse_participant_identity(&inbound.sender_identity) != Some(claimed) {
            warn!(
                identity = %inbound.sender_identity,
                "transport: frame sender does not match identity"
            );
            continue;
        }
        on_frame(frame);
    }
}

pub(crate) fn received(mut message: ChatMessage) -> ChatMessage {
    message.status = message.status.merge(DeliveryStatus::Sent);
    message
}

#[cfg(test)]
#[path = "tests/background_tests.rs"]
mod tests;
