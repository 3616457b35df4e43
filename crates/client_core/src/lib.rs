use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, RwLock, Weak,
};

use chrono::Utc;
use conversation_transport::{ChannelConnector, ChannelSession};
use shared::{
    domain::{ChatMessage, ConversationId, ConversationKey, MessageId, UserId},
    protocol::{ChannelFrame, ConversationSummary, ServerEvent},
};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

mod background;
pub mod cache;
pub mod config;
mod delivery;
pub mod error;
pub mod gateway;
pub mod hub;
mod state;
pub mod typing;

pub use cache::{MessageCache, UpsertOutcome};
pub use config::{ReconnectPolicy, SyncConfig, TypingTimings};
pub use delivery::{display_status, DisplayStatus, PendingSend};
pub use error::SyncError;
pub use gateway::{HttpGateway, PersistenceGateway};
pub use hub::{HubConnector, HubStatus, NotificationHubClient, WsHubConnector};
pub use state::{Identity, SyncEvent};
pub use typing::TypingState;

use background::{join_channel, leave_all, pump_channel, received, BackgroundConnectionManager};
use delivery::DeliveryStateMachine;
use state::SyncState;
use typing::{TypingDebouncer, TypingTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Foreground,
    Background,
    None,
}

struct ForegroundSession {
    key: ConversationKey,
    session: Option<Arc<dyn ChannelSession>>,
    task: Option<JoinHandle<()>>,
    live: Arc<AtomicBool>,
}

impl ForegroundSession {
    fn detach(self) -> Option<Arc<dyn ChannelSession>> {
        self.live.store(false, Ordering::SeqCst);
        if let Some(task) = self.task {
            task.abort();
        }
        self.session
    }
}

struct EngineInner {
    config: SyncConfig,
    state: Arc<SyncState>,
    gateway: Arc<dyn PersistenceGateway>,
    connector: Arc<dyn ChannelConnector>,
    delivery: Arc<DeliveryStateMachine>,
    background: BackgroundConnectionManager,
    hub: NotificationHubClient,
    known: RwLock<Vec<ConversationSummary>>,
    foreground: Mutex<Option<ForegroundSession>>,
    typing_out: Mutex<TypingDebouncer>,
    typing_in: Mutex<TypingTracker>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        identity: Identity,
        config: SyncConfig,
        gateway: Arc<dyn PersistenceGateway>,
        connector: Arc<dyn ChannelConnector>,
        hub_connector: Arc<dyn HubConnector>,
    ) -> Self {
        let me = identity.user_id;
        let state = Arc::new(SyncState::new(identity));
        let delivery = DeliveryStateMachine::new(Arc::clone(&state), Arc::clone(&gateway));
        let background = BackgroundConnectionManager::new(
            Arc::clone(&state),
            Arc::clone(&gateway),
            Arc::clone(&connector),
            config.max_background_subscriptions,
        );
        let hub = NotificationHubClient::new(hub_connector, config.reconnect.clone());
        Self {
            inner: Arc::new(EngineInner {
                typing_out: Mutex::new(TypingDebouncer::new(config.typing.clone())),
                typing_in: Mutex::new(TypingTracker::new(me, config.typing.expiry)),
                config,
                state,
                gateway,
                connector,
                delivery,
                background,
                hub,
                known: RwLock::new(Vec::new()),
                foreground: Mutex::new(None),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.state.me
    }

    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.register_hub_handlers();
        let mut status = self.inner.hub.subscribe_status();
        self.inner.hub.start();

        let status_task = {
            let state = Arc::clone(&self.inner.state);
            tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let current = status.borrow_and_update().clone();
                    state.emit(SyncEvent::HubStatusChanged(current));
                }
            })
        };
        let poll_task = {
            let weak = Arc::downgrade(&self.inner);
            let interval = self.inner.config.fallback_poll_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if inner.hub.status() != HubStatus::Open {
                        let fetched = inner.reconcile_from_gateway().await;
                        debug!(fetched, "fallback: reconciliation pass");
                    }
                }
            })
        };
        locked(&self.inner.tasks).extend([status_task, poll_task]);
        info!(user_id = self.inner.state.me.user_id.0, "sync: engine started");
    }

    fn register_hub_handlers(&self) {
        let client = &self.inner.hub;

        let weak = Arc::downgrade(&self.inner);
        client.on(hub::NEW_MESSAGE, move |event| {
            let (Some(inner), ServerEvent::NewMessage {
                conversation_id,
                local_key,
                message,
            }) = (weak.upgrade(), event)
            else {
                return;
            };
            let local = ConversationKey::local(local_key);
            inner
                .state
                .link_keys(&local, &ConversationKey::Persisted(conversation_id));
            inner.state.apply_incoming(&local, received(message));
        });

        let weak = Arc::downgrade(&self.inner);
        client.on(hub::MESSAGES_READ, move |event| {
            let (Some(inner), ServerEvent::MessagesRead {
                message_ids,
                reader_id,
                ..
            }) = (weak.upgrade(), event)
            else {
                return;
            };
            let promoted = inner.delivery.apply_messages_read(&message_ids, reader_id);
            debug!(promoted, reader_id = reader_id.0, "hub: messages read");
        });

        let weak = Arc::downgrade(&self.inner);
        client.on(hub::TYPING, move |event| {
            let (Some(inner), ServerEvent::Typing {
                local_key,
                user_id,
                user_name,
                is_typing,
                ..
            }) = (weak.upgrade(), event)
            else {
                return;
            };
            inner.on_remote_typing(
                &ConversationKey::local(local_key),
                user_id,
                &user_name,
                is_typing,
            );
        });

        client.on(hub::CONNECTED, |event| {
            if let ServerEvent::Connected { user_id } = event {
                info!(user_id = user_id.0, "hub: session confirmed");
            }
        });
    }

    pub fn get(&self, key: &ConversationKey) -> Vec<ChatMessage> {
        self.inner.state.cache().get(key)
    }

    pub fn send(&self, key: &ConversationKey, content: &str) -> PendingSend {
        let session = self.inner.foreground_session_for(key);
        let pending = self.inner.delivery.send(key, content, session);
        self.inner.input_changed(key, false);
        pending
    }

    pub fn retry(&self, id: &MessageId) -> Result<PendingSend, SyncError> {
        let conversation = self
            .inner
            .state
            .cache()
            .find(id)
            .map(|m| m.conversation)
            .ok_or_else(|| SyncError::NotRetryable(id.clone()))?;
        let session = self.inner.foreground_session_for(&conversation);
        self.inner.delivery.retry(id, session)
    }

    pub async fn mark_read(
        &self,
        message_ids: &[MessageId],
        key: &ConversationKey,
    ) -> Result<u64, SyncError> {
        let conversation_id = self.inner.state.cache().linked_persisted(key);
        let accepted = self
            .inner
            .gateway
            .record_reads(message_ids, conversation_id)
            .await?;
        self.inner.state.clear_unread(key);
        Ok(accepted)
    }

    pub fn set_typing(&self, key: &ConversationKey, is_typing: bool) {
        self.inner.input_changed(key, is_typing);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.state.subscribe()
    }

    pub fn unread(&self, key: &ConversationKey) -> u32 {
        self.inner.state.unread(key)
    }

    pub fn typing(&self, key: &ConversationKey) -> Vec<TypingState> {
        let key = self.inner.state.canonical(key);
        locked(&self.inner.typing_in).active(&key, Instant::now())
    }

    pub fn subscription_mode(&self, key: &ConversationKey) -> SubscriptionMode {
        if self.inner.state.is_foreground(key) {
            SubscriptionMode::Foreground
        } else if self.inner.background.is_subscribed(key) {
            SubscriptionMode::Background
        } else {
            SubscriptionMode::None
        }
    }

    pub fn background_subscriptions(&self) -> Vec<ConversationKey> {
        self.inner.background.subscribed()
    }

    pub fn hub_status(&self) -> HubStatus {
        self.inner.hub.status()
    }

    pub fn resume_hub(&self) {
        self.inner.hub.resume();
    }

    pub fn display_status(&self, message: &ChatMessage) -> DisplayStatus {
        display_status(message, Utc::now(), self.inner.config.delivered_hint_after)
    }

    pub async fn open_conversation(&self, key: &ConversationKey) -> Result<(), SyncError> {
        let inner = &self.inner;
        inner.leave_foreground().await;
        inner.state.set_foreground(Some(key.clone()));
        if let Some(session) = inner.background.detach(key) {
            leave_all(vec![session]).await;
        }
        inner.state.clear_unread(key);

        let conversation_id = match inner.delivery.resolve_persisted(key).await {
            Ok(id) => Some(id),
            Err(error @ (SyncError::Persistence(_) | SyncError::Transport(_))) => {
                warn!(conversation = %key, %error, "sync: opening conversation offline");
                None
            }
            Err(error) => return Err(error),
        };

        let live = Arc::new(AtomicBool::new(true));
        let mut foreground = ForegroundSession {
            key: inner.state.canonical(key),
            session: None,
            task: None,
            live: Arc::clone(&live),
        };
        if let Some(conversation_id) = conversation_id {
            match join_channel(inner.gateway.as_ref(), inner.connector.as_ref(), conversation_id)
                .await
            {
                Ok(session) => {
                    foreground.task = Some(self.spawn_foreground_pump(key, &session, live));
                    foreground.session = Some(session);
                }
                Err(error) => {
                    warn!(conversation = %key, %error, "sync: no transport, relying on hub");
                }
            }
            if let Err(error) = inner.load_page(key, conversation_id, None).await {
                warn!(conversation = %key, %error, "sync: history fetch failed, keeping cache");
            }
            if let Err(error) = inner.delivery.refresh_receipts(key).await {
                warn!(conversation = %key, %error, "sync: receipt refresh failed");
            }
        }

        let replaced = locked(&inner.foreground).replace(foreground);
        if let Some(session) = replaced.and_then(ForegroundSession::detach) {
            leave_all(vec![session]).await;
        }
        info!(conversation = %key, "sync: conversation opened");

        let known = inner.known();
        inner.background.reconcile(&known).await;
        Ok(())
    }

    fn spawn_foreground_pump(
        &self,
        key: &ConversationKey,
        session: &Arc<dyn ChannelSession>,
        live: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();
        tokio::spawn(pump_channel(session.subscribe_events(), live, move |frame| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match frame {
                ChannelFrame::Message { message } => {
                    inner.state.apply_incoming(&key, received(message));
                }
                ChannelFrame::Typing {
                    user_id,
                    user_name,
                    is_typing,
                } => inner.on_remote_typing(&key, user_id, &user_name, is_typing),
            }
        }))
    }

    pub async fn close_conversation(&self) {
        self.inner.leave_foreground().await;
        let known = self.inner.known();
        self.inner.background.reconcile(&known).await;
    }

    pub async fn set_conversations(&self, conversations: Vec<ConversationSummary>) {
        *self
            .inner
            .known
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = conversations.clone();
        self.inner.background.reconcile(&conversations).await;
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
        let conversations = self.inner.gateway.list_conversations().await?;
        self.set_conversations(conversations.clone()).await;
        Ok(conversations)
    }

    pub async fn load_older(&self, key: &ConversationKey) -> Result<usize, SyncError> {
        let conversation_id = self
            .inner
            .state
            .cache()
            .linked_persisted(key)
            .ok_or_else(|| SyncError::UnknownConversation(key.to_string()))?;
        let before = self.get(key).first().map(|m| m.timestamp);
        self.inner.load_page(key, conversation_id, before).await
    }

    pub async fn refresh_receipts(&self, key: &ConversationKey) -> Result<usize, SyncError> {
        self.inner.delivery.refresh_receipts(key).await
    }

    pub async fn reconcile_now(&self) -> usize {
        self.inner.reconcile_from_gateway().await
    }

    pub async fn shutdown(&self) {
        self.inner.hub.stop();
        for task in locked(&self.inner.tasks).drain(..) {
            task.abort();
        }
        self.inner.leave_foreground().await;
        self.inner.background.shutdown().await;
        info!("sync: engine stopped");
    }
}

impl EngineInner {
    fn known(&self) -> Vec<ConversationSummary> {
        self.known
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn foreground_session_for(&self, key: &ConversationKey) -> Option<Arc<dyn ChannelSession>> {
        let foreground = locked(&self.foreground);
        let current = foreground.as_ref()?;
        if self.state.cache().is_linked(&current.key, key) {
            current.session.clone()
        } else {
            None
        }
    }

    async fn leave_foreground(&self) {
        let previous = locked(&self.foreground).take();
        self.state.set_foreground(None);
        if let Some(previous) = previous {
            debug!(conversation = %previous.key, "sync: foreground released");
            if let Some(session) = previous.detach() {
                leave_all(vec![session]).await;
            }
        }
    }

    async fn load_page(
        &self,
        key: &ConversationKey,
        conversation_id: ConversationId,
        before: Option<chrono::DateTime<Utc>>,
    ) -> Result<usize, SyncError> {
        let fetched = self
            .gateway
            .list_messages(conversation_id, self.config.history_page_size, before)
            .await;
        self.state.apply_fetch(key, fetched)
    }

    async fn reconcile_from_gateway(&self) -> usize {
        let mut targets: Vec<(ConversationKey, ConversationId)> = self
            .known()
            .into_iter()
            .map(|c| (ConversationKey::local(c.local_key), c.conversation_id))
            .collect();
        if let Some(key) = self.state.foreground() {
            let linked = self.state.cache().linked_persisted(&key);
            if let Some(id) = linked {
                if !targets.iter().any(|(_, known)| *known == id) {
                    targets.push((key, id));
                }
            }
        }

        let mut fetched = 0;
        for (key, conversation_id) in targets {
            match self.load_page(&key, conversation_id, None).await {
                Ok(count) => fetched += count,
                Err(error) => {
                    warn!(conversation = %key, %error, "fallback: fetch failed, keeping cache");
                }
            }
        }
        fetched
    }

    fn input_changed(self: &Arc<Self>, key: &ConversationKey, has_content: bool) {
        let key = self.state.canonical(key);
        let decision = locked(&self.typing_out).on_input(&key, has_content, Instant::now());
        if let Some(is_typing) = decision.publish {
            let inner = Arc::clone(self);
            let key = key.clone();
            tokio::spawn(async move { inner.publish_typing(&key, is_typing).await });
        }
        if let Some(generation) = decision.arm_idle {
            let weak = Arc::downgrade(self);
            let idle = self.config.typing.idle_stop;
            tokio::spawn(async move {
                tokio::time::sleep(idle).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let stop = locked(&inner.typing_out).on_idle(&key, generation);
                if stop {
                    inner.publish_typing(&key, false).await;
                }
            });
        }
    }

    async fn publish_typing(&self, key: &ConversationKey, is_typing: bool) {
        if let Some(session) = self.foreground_session_for(key) {
            let frame = ChannelFrame::Typing {
                user_id: self.state.me.user_id,
                user_name: self.state.me.username.clone(),
                is_typing,
            };
            match frame.encode() {
                Ok(payload) => {
                    if let Err(error) = session.publish(payload).await {
                        warn!(conversation = %key, %error, "typing: transport publish failed");
                    }
                }
                Err(error) => warn!(%error, "typing: frame encode failed"),
            }
        }
        let conversation_id = self.state.cache().linked_persisted(key);
        if let Some(conversation_id) = conversation_id {
            if let Err(error) = self.gateway.send_typing(conversation_id, is_typing).await {
                warn!(conversation = %key, %error, "typing: hub relay failed");
            }
        }
    }

    fn on_remote_typing(
        self: &Arc<Self>,
        key: &ConversationKey,
        user_id: UserId,
        user_name: &str,
        is_typing: bool,
    ) {
        let key = self.state.canonical(key);
        let now = Instant::now();
        let changed = locked(&self.typing_in).apply(&key, user_id, user_name, is_typing, now);
        if changed {
            self.emit_typing(&key);
        }
        if is_typing {
            let weak: Weak<Self> = Arc::downgrade(self);
            let expiry = self.config.typing.expiry;
            tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let expired = locked(&inner.typing_in).purge_expired(Instant::now());
                for key in expired {
                    inner.emit_typing(&key);
                }
            });
        }
    }

    fn emit_typing(&self, key: &ConversationKey) {
        let typing = locked(&self.typing_in).active(key, Instant::now());
        self.state.emit(SyncEvent::TypingChanged {
            conversation: key.clone(),
            typing,
        });
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for task in locked(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(foreground) = locked(&self.foreground).take() {
            let _ = foreground.detach();
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
