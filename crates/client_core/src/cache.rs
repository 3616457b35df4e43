use std::collections::HashMap;

use shared::domain::{ChatMessage, ConversationId, ConversationKey, DeliveryStatus, MessageId};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct MessageCache {
    parents: HashMap<ConversationKey, ConversationKey>,
    members: HashMap<ConversationKey, Vec<ConversationKey>>,
    lists: HashMap<ConversationKey, Vec<ChatMessage>>,
    index: HashMap<MessageId, ConversationKey>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canonical(&self, key: &ConversationKey) -> ConversationKey {
        let mut current = key;
        while let Some(parent) = self.parents.get(current) {
            current = parent;
        }
        current.clone()
    }

    pub fn is_linked(&self, a: &ConversationKey, b: &ConversationKey) -> bool {
        self.canonical(a) == self.canonical(b)
    }

    pub fn linked_persisted(&self, key: &ConversationKey) -> Option<ConversationId> {
        if let Some(id) = key.persisted_id() {
            return Some(id);
        }
        self.aliases(key).into_iter().find_map(|k| k.persisted_id())
    }

    pub fn linked_local(&self, key: &ConversationKey) -> Option<String> {
        if let Some(local) = key.local_key() {
            return Some(local.to_string());
        }
        self.aliases(key)
            .into_iter()
            .find_map(|k| k.local_key().map(str::to_string))
    }

    fn aliases(&self, key: &ConversationKey) -> Vec<ConversationKey> {
        let root = self.canonical(key);
        self.members
            .get(&root)
            .cloned()
            .unwrap_or_else(|| vec![root])
    }

    pub fn link_keys(&mut self, local: &ConversationKey, persisted: &ConversationKey) -> bool {
        let root = self.canonical(local);
        let other = self.canonical(persisted);
        if root == other {
            return false;
        }

        let moved = self.lists.remove(&other).unwrap_or_default();
        for message in moved {
            self.merge_into(&root, message);
        }

        let mut joined = self
            .members
            .remove(&other)
            .unwrap_or_else(|| vec![other.clone()]);
        let members = self
            .members
            .entry(root.clone())
            .or_insert_with(|| vec![root.clone()]);
        members.append(&mut joined);
        self.parents.insert(other, root);
        true
    }

    pub fn upsert(&mut self, key: &ConversationKey, message: ChatMessage) -> UpsertOutcome {
        let root = self.canonical(key);
        self.index
            .entry(message.id.clone())
            .or_insert_with(|| key.clone());
        self.merge_into(&root, message)
    }

    fn merge_into(&mut self, root: &ConversationKey, message: ChatMessage) -> UpsertOutcome {
        let list = self.lists.entry(root.clone()).or_default();
        match list.iter().position(|m| m.id == message.id) {
            None => {
                list.push(message);
                sort_messages(list);
                UpsertOutcome::Inserted
            }
            Some(pos) => {
                let current = &list[pos];
                let status = current.status.merge(message.status);
                let merged = ChatMessage { status, ..message };
                if &merged == current {
                    return UpsertOutcome::Unchanged;
                }
                let reorder = merged.timestamp != current.timestamp;
                list[pos] = merged;
                if reorder {
                    sort_messages(list);
                }
                UpsertOutcome::Updated
            }
        }
    }

    pub fn get(&self, key: &ConversationKey) -> Vec<ChatMessage> {
        self.lists
            .get(&self.canonical(key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn apply_fetch(
        &mut self,
        key: &ConversationKey,
        fetched: Result<Vec<ChatMessage>, SyncError>,
    ) -> Vec<ChatMessage> {
        let Ok(messages) = fetched else {
            return Vec::new();
        };
        let mut inserted = Vec::new();
        for message in messages {
            if self.upsert(key, message.clone()) == UpsertOutcome::Inserted {
                inserted.push(message);
            }
        }
        inserted
    }

    pub fn find(&self, id: &MessageId) -> Option<ChatMessage> {
        let key = self.index.get(id)?;
        self.lists
            .get(&self.canonical(key))?
            .iter()
            .find(|m| &m.id == id)
            .cloned()
    }

    pub fn apply_status(&mut self, id: &MessageId, status: DeliveryStatus) -> Option<ChatMessage> {
        let message = self.message_mut(id)?;
        let merged = message.status.merge(status);
        if merged == message.status {
            return None;
        }
        message.status = merged;
        Some(message.clone())
    }

    // the only path that lowers a status
    pub fn reset_for_retry(&mut self, id: &MessageId) -> Option<ChatMessage> {
        let message = self.message_mut(id)?;
        if message.status != DeliveryStatus::Failed {
            return None;
        }
        message.status = DeliveryStatus::Sending;
        Some(message.clone())
    }

    fn message_mut(&mut self, id: &MessageId) -> Option<&mut ChatMessage> {
        let key = self.index.get(id)?;
        let root = self.canonical(key);
        self.lists.get_mut(&root)?.iter_mut().find(|m| &m.id == id)
    }
}

fn sort_messages(list: &mut [ChatMessage]) {
    list.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
