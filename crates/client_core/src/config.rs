use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Durations are milliseconds in TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub reconnect: ReconnectPolicy,
    pub typing: TypingTimings,
    pub max_background_subscriptions: usize,
    pub history_page_size: u32,
    #[serde(with = "millis")]
    pub delivered_hint_after: Duration,
    #[serde(with = "millis")]
    pub fallback_poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            typing: TypingTimings::default(),
            max_background_subscriptions: 32,
            history_page_size: 50,
            delivered_hint_after: Duration::from_secs(5),
            fallback_poll_interval: Duration::from_secs(15),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingTimings {
    #[serde(with = "millis")]
    pub debounce: Duration,
    #[serde(with = "millis")]
    pub idle_stop: Duration,
    #[serde(with = "millis")]
    pub expiry: Duration,
}

impl Default for TypingTimings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            idle_stop: Duration::from_secs(3),
            expiry: Duration::from_secs(3),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
