//! Seam to the external real-time session service that carries
//! per-conversation channels.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tokio::sync::broadcast;

pub mod memory;

pub use memory::InMemoryRelay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelJoin {
    pub channel_name: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    pub sender_identity: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(InboundPayload),
    Disconnected,
}

#[async_trait]
pub trait ChannelSession: Send + Sync {
    /// Sends an opaque payload to every other member of the channel.
    async fn publish(&self, payload: Vec<u8>) -> anyhow::Result<()>;
    async fn leave(&self) -> anyhow::Result<()>;
    fn channel_name(&self) -> &str;
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, join: ChannelJoin) -> anyhow::Result<Arc<dyn ChannelSession>>;
}

/// Connector used when no session service is configured. Every connect
/// fails, which leaves delivery to the notification hub.
pub struct MissingChannelConnector;

#[async_trait]
impl ChannelConnector for MissingChannelConnector {
    async fn connect(&self, join: ChannelJoin) -> anyhow::Result<Arc<dyn ChannelSession>> {
        Err(anyhow!(
            "no conversation transport configured for channel {}",
            join.channel_name
        ))
    }
}

pub fn channel_name_for(local_key: &str) -> String {
    format!("chat-{local_key}")
}

pub fn participant_identity(user_id: UserId) -> String {
    format!("user:{}", user_id.0)
}

pub fn parse_participant_identity(identity: &str) -> Option<UserId> {
    identity
        .strip_prefix("user:")
        .and_then(|raw| raw.parse().ok())
        .map(UserId)
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub api_key: String,
    pub api_secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelGrant {
    pub channel_join: bool,
    pub channel: String,
    pub can_publish_data: bool,
    pub can_subscribe: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinClaims {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub grant: ChannelGrant,
}

/// Mints the join token the session service checks before admitting a
/// participant to `channel_name`.
pub fn mint_join_token(
    cfg: &TokenConfig,
    user_id: UserId,
    channel_name: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = JoinClaims {
        iss: cfg.api_key.clone(),
        sub: participant_identity(user_id),
        iat: now.timestamp(),
        exp: exp.timestamp(),
        grant: ChannelGrant {
            channel_join: true,
            channel: channel_name.to_string(),
            can_publish_data: true,
            can_subscribe: true,
        },
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.api_secret.as_bytes()),
    )
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
