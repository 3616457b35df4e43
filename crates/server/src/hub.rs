use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use server_api::Notification;
use shared::{domain::UserId, protocol::ServerEvent};
use tokio::sync::mpsc;
use tracing::debug;

/// Per-user fan-out of hub events to every live websocket session.
///
/// Events for a user with no session are dropped; clients catch up through
/// the message history instead.
#[derive(Clone, Default)]
pub(crate) struct NotificationHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<UserId, HashMap<u64, mpsc::UnboundedSender<ServerEvent>>>,
    next_session_id: u64,
}

pub(crate) struct HubRegistration {
    pub(crate) session_id: u64,
    pub(crate) events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl NotificationHub {
    pub(crate) fn register(&self, user_id: UserId) -> HubRegistration {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.next_session_id += 1;
        let session_id = state.next_session_id;
        state
            .sessions
            .entry(user_id)
            .or_default()
            .insert(session_id, tx);
        HubRegistration {
            session_id,
            events: rx,
        }
    }

    pub(crate) fn unregister(&self, user_id: UserId, session_id: u64) {
        let mut state = self.state();
        if let Some(sessions) = state.sessions.get_mut(&user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                state.sessions.remove(&user_id);
            }
        }
    }

    /// Pushes `event` to every session of `user_id`, returning how many
    /// sessions accepted it.
    pub(crate) fn notify_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let mut state = self.state();
        let Some(sessions) = state.sessions.get_mut(&user_id) else {
            debug!(user_id = user_id.0, kind = event.kind(), "hub: no session, event dropped");
            return 0;
        };
        sessions.retain(|_, tx| tx.send(event.clone()).is_ok());
        let delivered = sessions.len();
        if sessions.is_empty() {
            state.sessions.remove(&user_id);
        }
        delivered
    }

    pub(crate) fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.notify_user(notification.target, &notification.event);
        }
    }

    pub(crate) fn session_count(&self, user_id: UserId) -> usize {
        self.state().sessions.get(&user_id).map_or(0, HashMap::len)
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
