use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const SETTINGS_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            page_size: 30,
            request_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(2),
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    page_size: Option<u32>,
    request_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    event_buffer: Option<usize>,
}

/// Defaults, then `chat_client.toml` in the working directory, then
/// environment overrides.
pub fn load_settings() -> anyhow::Result<ClientSettings> {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?;
        if let Some(v) = file_cfg.server_url {
            settings.server_url = v;
        }
        if let Some(v) = file_cfg.page_size {
            settings.page_size = v;
        }
        if let Some(v) = file_cfg.request_timeout_ms {
            settings.request_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.reconnect_delay_ms {
            settings.reconnect_delay = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.event_buffer {
            settings.event_buffer = v;
        }
    }

    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__PAGE_SIZE") {
        settings.page_size = v
            .parse()
            .with_context(|| format!("APP__PAGE_SIZE is not a number: {v}"))?;
    }
    if let Some(v) = env("APP__REQUEST_TIMEOUT_MS") {
        let millis: u64 = v
            .parse()
            .with_context(|| format!("APP__REQUEST_TIMEOUT_MS is not a number: {v}"))?;
        settings.request_timeout = Duration::from_millis(millis);
    }
    if let Some(v) = env("APP__RECONNECT_DELAY_MS") {
        let millis: u64 = v
            .parse()
            .with_context(|| format!("APP__RECONNECT_DELAY_MS is not a number: {v}"))?;
        settings.reconnect_delay = Duration::from_millis(millis);
    }

    settings.server_url = settings.server_url.trim_end_matches('/').to_string();
    settings.page_size = settings.page_size.clamp(1, 100);
    settings.event_buffer = settings.event_buffer.max(16);
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
