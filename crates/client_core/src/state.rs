use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use shared::domain::{ChatMessage, ConversationKey, DeliveryStatus, MessageId, UserId};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    cache::{MessageCache, UpsertOutcome},
    error::SyncError,
    hub::HubStatus,
    typing::TypingState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    MessageUpdated {
        conversation: ConversationKey,
        message: ChatMessage,
    },
    UnreadChanged {
        conversation: ConversationKey,
        unread: u32,
    },
    TypingChanged {
        conversation: ConversationKey,
        typing: Vec<TypingState>,
    },
    HubStatusChanged(HubStatus),
}

// std locks, never held across an await
pub(crate) struct SyncState {
    pub(crate) me: Identity,
    cache: RwLock<MessageCache>,
    unread: Mutex<HashMap<ConversationKey, u32>>,
    foreground: RwLock<Option<ConversationKey>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncState {
    pub(crate) fn new(me: Identity) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            me,
            cache: RwLock::new(MessageCache::new()),
            unread: Mutex::new(HashMap::new()),
            foreground: RwLock::new(None),
            events,
        }
    }

    pub(crate) fn cache(&self) -> RwLockReadGuard<'_, MessageCache> {
        self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn cache_mut(&self) -> RwLockWriteGuard<'_, MessageCache> {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unread_counts(&self) -> MutexGuard<'_, HashMap<ConversationKey, u32>> {
        self.unread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn canonical(&self, key: &ConversationKey) -> ConversationKey {
        self.cache().canonical(key)
    }

    pub(crate) fn link_keys(&self, local: &ConversationKey, persisted: &ConversationKey) -> bool {
        let (linked, roots, root) = {
            let mut cache = self.cache_mut();
            let roots = [cache.canonical(local), cache.canonical(persisted)];
            let linked = cache.link_keys(local, persisted);
            (linked, roots, cache.canonical(local))
        };
        if !linked {
            return false;
        }
        debug!(local = %local, persisted = %persisted, "cache: keys linked");

        // counts kept under the absorbed root move to the surviving one
        let merged = {
            let mut counts = self.unread_counts();
            let moved: u32 = roots
                .iter()
                .filter(|old| **old != root)
                .filter_map(|old| counts.remove(old))
                .sum();
            if moved == 0 {
                None
            } else {
                let count = counts.entry(root.clone()).or_insert(0);
                *count += moved;
                Some(*count)
            }
        };
        if let Some(unread) = merged {
            self.emit(SyncEvent::UnreadChanged {
                conversation: root,
                unread,
            });
        }
        true
    }

    pub(crate) fn upsert(&self, key: &ConversationKey, message: ChatMessage) -> UpsertOutcome {
        let (outcome, conversation, stored) = {
            let mut cache = self.cache_mut();
            let id = message.id.clone();
            let outcome = cache.upsert(key, message);
            (outcome, cache.canonical(key), cache.find(&id))
        };
        if outcome != UpsertOutcome::Unchanged {
            if let Some(message) = stored {
                self.emit(SyncEvent::MessageUpdated {
                    conversation,
                    message,
                });
            }
        }
        outcome
    }

    pub(crate) fn apply_incoming(&self, key: &ConversationKey, message: ChatMessage) -> UpsertOutcome {
        let from_other = message.sender_id != self.me.user_id;
        let outcome = self.upsert(key, message);
        if outcome == UpsertOutcome::Inserted && from_other && !self.is_foreground(key) {
            self.bump_unread(key);
        }
        outcome
    }

    pub(crate) fn apply_fetch(
        &self,
        key: &ConversationKey,
        fetched: Result<Vec<ChatMessage>, SyncError>,
    ) -> Result<usize, SyncError> {
        let failure = fetched.as_ref().err().cloned();
        let (inserted, conversation, newest) = {
            let mut cache = self.cache_mut();
            let newest = cache.get(key).last().map(|m| m.timestamp);
            (cache.apply_fetch(key, fetched), cache.canonical(key), newest)
        };
        if let Some(error) = failure {
            return Err(error);
        }
        // only messages past what was already cached count as unread; a
        // first page or an older page is history
        let foreground = self.is_foreground(key);
        for message in &inserted {
            let missed = newest.is_some_and(|newest| message.timestamp > newest);
            if missed && message.sender_id != self.me.user_id && !foreground {
                self.bump_unread(key);
            }
            self.emit(SyncEvent::MessageUpdated {
                conversation: conversation.clone(),
                message: message.clone(),
            });
        }
        Ok(inserted.len())
    }

    pub(crate) fn apply_status(&self, id: &MessageId, status: DeliveryStatus) -> Option<ChatMessage> {
        let (changed, conversation) = {
            let mut cache = self.cache_mut();
            let changed = cache.apply_status(id, status)?;
            let conversation = cache.canonical(&changed.conversation);
            (changed, conversation)
        };
        self.emit(SyncEvent::MessageUpdated {
            conversation,
            message: changed.clone(),
        });
        Some(changed)
    }

    pub(crate) fn reset_for_retry(&self, id: &MessageId) -> Option<ChatMessage> {
        let (message, conversation) = {
            let mut cache = self.cache_mut();
            let message = cache.reset_for_retry(id)?;
            let conversation = cache.canonical(&message.conversation);
            (message, conversation)
        };
        self.emit(SyncEvent::MessageUpdated {
            conversation,
            message: message.clone(),
        });
        Some(message)
    }

    pub(crate) fn set_foreground(&self, key: Option<ConversationKey>) {
        let key = key.map(|k| self.canonical(&k));
        *self
            .foreground
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = key;
    }

    pub(crate) fn foreground(&self) -> Option<ConversationKey> {
        self.foreground
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn is_foreground(&self, key: &ConversationKey) -> bool {
        match self.foreground() {
            Some(current) => self.cache().is_linked(&current, key),
            None => false,
        }
    }

    pub(crate) fn unread(&self, key: &ConversationKey) -> u32 {
        let key = self.canonical(key);
        self.unread_counts().get(&key).copied().unwrap_or(0)
    }

    fn bump_unread(&self, key: &ConversationKey) {
        let key = self.canonical(key);
        let unread = {
            let mut counts = self.unread_counts();
            let count = counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.emit(SyncEvent::UnreadChanged {
            conversation: key,
            unread,
        });
    }

    pub(crate) fn clear_unread(&self, key: &ConversationKey) {
        let key = self.canonical(key);
        let cleared = self.unread_counts().remove(&key).is_some_and(|n| n > 0);
        if cleared {
            self.emit(SyncEvent::UnreadChanged {
                conversation: key,
                unread: 0,
            });
        }
    }
}
