use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{ChannelConnector, ChannelEvent, ChannelJoin, ChannelSession, InboundPayload};

const SESSION_EVENT_CAPACITY: usize = 256;

/// Process-local channel service. Every connector handed out by one relay
/// shares the same channels, which is enough to run several clients in a
/// single process.
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

#[derive(Default)]
struct RelayState {
    channels: HashMap<String, HashMap<u64, Member>>,
    refused: HashSet<String>,
    next_session_id: u64,
}

struct Member {
    identity: String,
    events: broadcast::Sender<ChannelEvent>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, identity: impl Into<String>) -> RelayConnector {
        RelayConnector {
            relay: self.clone(),
            identity: identity.into(),
        }
    }

    /// Makes every later connect to `channel_name` fail.
    pub fn refuse_channel(&self, channel_name: &str) {
        self.state().refused.insert(channel_name.to_string());
    }

    pub fn allow_channel(&self, channel_name: &str) {
        self.state().refused.remove(channel_name);
    }

    pub fn session_count(&self, channel_name: &str) -> usize {
        self.state()
            .channels
            .get(channel_name)
            .map_or(0, HashMap::len)
    }

    /// Number of sessions `identity` holds in `channel_name`.
    pub fn sessions_for(&self, channel_name: &str, identity: &str) -> usize {
        self.state().channels.get(channel_name).map_or(0, |members| {
            members
                .values()
                .filter(|member| member.identity == identity)
                .count()
        })
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, channel_name: &str, session_id: u64) -> bool {
        let mut state = self.state();
        let Some(members) = state.channels.get_mut(channel_name) else {
            return false;
        };
        let removed = members.remove(&session_id).is_some();
        if members.is_empty() {
            state.channels.remove(channel_name);
        }
        removed
    }
}

pub struct RelayConnector {
    relay: InMemoryRelay,
    identity: String,
}

#[async_trait]
impl ChannelConnector for RelayConnector {
    async fn connect(&self, join: ChannelJoin) -> Result<Arc<dyn ChannelSession>> {
        let (tx, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let session_id = {
            let mut state = self.relay.state();
            if state.refused.contains(&join.channel_name) {
                return Err(anyhow!("channel {} refused the connection", join.channel_name));
            }
            state.next_session_id += 1;
            let session_id = state.next_session_id;
            state
                .channels
                .entry(join.channel_name.clone())
                .or_default()
                .insert(
                    session_id,
                    Member {
                        identity: self.identity.clone(),
                        events: tx.clone(),
                    },
                );
            session_id
        };
        debug!(channel = %join.channel_name, identity = %self.identity, session_id, "relay: joined");

        Ok(Arc::new(RelaySession {
            relay: self.relay.clone(),
            channel_name: join.channel_name,
            identity: self.identity.clone(),
            session_id,
            events: tx,
            left: AtomicBool::new(false),
        }))
    }
}

struct RelaySession {
    relay: InMemoryRelay,
    channel_name: String,
    identity: String,
    session_id: u64,
    events: broadcast::Sender<ChannelEvent>,
    left: AtomicBool,
}

#[async_trait]
impl ChannelSession for RelaySession {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        if self.left.load(Ordering::SeqCst) {
            return Err(anyhow!("session for {} already left", self.channel_name));
        }
        let targets: Vec<broadcast::Sender<ChannelEvent>> = {
            let state = self.relay.state();
            state
                .channels
                .get(&self.channel_name)
                .map(|members| {
                    members
                        .iter()
                        .filter(|(id, _)| **id != self.session_id)
                        .map(|(_, member)| member.events.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for target in targets {
            let _ = target.send(ChannelEvent::Data(InboundPayload {
                sender_identity: self.identity.clone(),
                payload: payload.clone(),
            }));
        }
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.relay.remove(&self.channel_name, self.session_id);
        let _ = self.events.send(ChannelEvent::Disconnected);
        debug!(channel = %self.channel_name, identity = %self.identity, "relay: left");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        &self.channel_name
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        if !self.left.load(Ordering::SeqCst) {
            self.relay.remove(&self.channel_name, self.session_id);
        }
    }
}
