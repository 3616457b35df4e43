use std::collections::HashMap;

use shared::domain::{ConversationKey, UserId};
use tokio::time::Instant;

use crate::config::TypingTimings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingState {
    pub conversation: ConversationKey,
    pub user_id: UserId,
    pub user_name: String,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypingDecision {
    pub publish: Option<bool>,
    pub arm_idle: Option<u64>,
}

#[derive(Debug, Default)]
struct OutgoingTyping {
    last_start: Option<Instant>,
    active: bool,
    generation: u64,
}

#[derive(Debug)]
pub struct TypingDebouncer {
    timings: TypingTimings,
    conversations: HashMap<ConversationKey, OutgoingTyping>,
}

impl TypingDebouncer {
    pub fn new(timings: TypingTimings) -> Self {
        Self {
            timings,
            conversations: HashMap::new(),
        }
    }

    pub fn timings(&self) -> &TypingTimings {
        &self.timings
    }

    pub fn on_input(&mut self, key: &ConversationKey, has_content: bool, now: Instant) -> TypingDecision {
        let entry = self.conversations.entry(key.clone()).or_default();
        entry.generation += 1;

        if !has_content {
            let was_active = entry.active;
            entry.active = false;
            entry.last_start = None;
            return TypingDecision {
                publish: was_active.then_some(false),
                arm_idle: None,
            };
        }

        let due = entry
            .last_start
            .map_or(true, |at| now.duration_since(at) >= self.timings.debounce);
        let publish = if due {
            entry.last_start = Some(now);
            entry.active = true;
            Some(true)
        } else {
            None
        };
        TypingDecision {
            publish,
            arm_idle: Some(entry.generation),
        }
    }

    // timers superseded by newer input are ignored
    pub fn on_idle(&mut self, key: &ConversationKey, generation: u64) -> bool {
        let Some(entry) = self.conversations.get_mut(key) else {
            return false;
        };
        if entry.generation != generation || !entry.active {
            return false;
        }
        entry.active = false;
        entry.last_start = None;
        true
    }
}

#[derive(Debug)]
pub struct TypingTracker {
    me: UserId,
    expiry: std::time::Duration,
    entries: HashMap<(ConversationKey, UserId), TypingState>,
}

impl TypingTracker {
    pub fn new(me: UserId, expiry: std::time::Duration) -> Self {
        Self {
            me,
            expiry,
            entries: HashMap::new(),
        }
    }

    pub fn apply(
        &mut self,
        key: &ConversationKey,
        user_id: UserId,
        user_name: &str,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        if user_id == self.me {
            return false;
        }
        let slot = (key.clone(), user_id);
        if !is_typing {
            return self.entries.remove(&slot).is_some();
        }
        let fresh = !self.entries.contains_key(&slot);
        self.entries.insert(
            slot,
            TypingState {
                conversation: key.clone(),
                user_id,
                user_name: user_name.to_string(),
                expires_at: now + self.expiry,
            },
        );
        fresh
    }

    pub fn active(&self, key: &ConversationKey, now: Instant) -> Vec<TypingState> {
        let mut typing: Vec<_> = self
            .entries
            .values()
            .filter(|s| &s.conversation == key && s.expires_at > now)
            .cloned()
            .collect();
        typing.sort_by_key(|s| s.user_id);
        typing
    }

    pub fn purge_expired(&mut self, now: Instant) -> Vec<ConversationKey> {
        let mut changed = Vec::new();
        self.entries.retain(|_, state| {
            let keep = state.expires_at > now;
            if !keep && !changed.contains(&state.conversation) {
                changed.push(state.conversation.clone());
            }
            keep
        });
        changed
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
