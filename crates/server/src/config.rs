use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub auth_secret: String,
    pub auth_ttl_seconds: i64,
    pub transport_api_key: String,
    pub transport_api_secret: String,
    pub transport_ttl_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            auth_secret: "dev-auth-secret".into(),
            auth_ttl_seconds: 7 * 24 * 3600,
            transport_api_key: "devkey".into(),
            transport_api_secret: "devsecret".into(),
            transport_ttl_seconds: 3600,
        }
    }
}

/// Keys accepted in `server.toml`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    auth_secret: Option<String>,
    auth_ttl_seconds: Option<i64>,
    transport_api_key: Option<String>,
    transport_api_secret: Option<String>,
    transport_ttl_seconds: Option<i64>,
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Applies `server.toml` contents, then environment overrides, on top of
/// the defaults. `APP__*` variables win over their short forms.
pub fn load_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file_contents {
        match toml::from_str::<FileSettings>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.bind_addr {
                    settings.server_bind = v;
                }
                if let Some(v) = file_cfg.database_url {
                    settings.database_url = v;
                }
                if let Some(v) = file_cfg.auth_secret {
                    settings.auth_secret = v;
                }
                if let Some(v) = file_cfg.auth_ttl_seconds {
                    settings.auth_ttl_seconds = v;
                }
                if let Some(v) = file_cfg.transport_api_key {
                    settings.transport_api_key = v;
                }
                if let Some(v) = file_cfg.transport_api_secret {
                    settings.transport_api_secret = v;
                }
                if let Some(v) = file_cfg.transport_ttl_seconds {
                    settings.transport_ttl_seconds = v;
                }
            }
            Err(error) => warn!(%error, "ignoring unreadable server.toml"),
        }
    }

    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = env(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = env(key) {
            settings.database_url = v;
        }
    }
    if let Some(v) = env("APP__AUTH_SECRET") {
        settings.auth_secret = v;
    }
    if let Some(v) = env("APP__AUTH_TTL_SECONDS").and_then(|v| v.parse().ok()) {
        settings.auth_ttl_seconds = v;
    }
    if let Some(v) = env("APP__TRANSPORT_API_KEY") {
        settings.transport_api_key = v;
    }
    if let Some(v) = env("APP__TRANSPORT_API_SECRET") {
        settings.transport_api_secret = v;
    }
    if let Some(v) = env("APP__TRANSPORT_TTL_SECONDS").and_then(|v| v.parse().ok()) {
        settings.transport_ttl_seconds = v;
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
