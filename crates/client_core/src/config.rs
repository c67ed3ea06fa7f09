use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

use crate::retry::RetryPolicy;

pub const DEFAULT_SETTINGS_FILE: &str = "portal.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    /// Identity handed over by the sign-in layer; the CLI may override it.
    pub user_id: Option<i64>,
    pub load_timeout_ms: u64,
    pub load_retry_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_attachment_bytes: u64,
    pub recipient_cache_ttl_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            user_id: None,
            load_timeout_ms: 10_000,
            load_retry_attempts: 4,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4_000,
            max_attachment_bytes: 25 * 1024 * 1024,
            recipient_cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    user_id: Option<i64>,
    load_timeout_ms: Option<u64>,
    load_retry_attempts: Option<usize>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    max_attachment_bytes: Option<u64>,
    recipient_cache_ttl_secs: Option<u64>,
}

impl ClientSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.load_retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            timeout: Duration::from_millis(self.load_timeout_ms),
        }
    }

    pub fn recipient_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.recipient_cache_ttl_secs)
    }

    fn apply_file(&mut self, file_cfg: FileSettings) {
        if let Some(v) = file_cfg.server_url {
            self.server_url = v;
        }
        if let Some(v) = file_cfg.user_id {
            self.user_id = Some(v);
        }
        if let Some(v) = file_cfg.load_timeout_ms {
            self.load_timeout_ms = v;
        }
        if let Some(v) = file_cfg.load_retry_attempts {
            self.load_retry_attempts = v;
        }
        if let Some(v) = file_cfg.retry_base_delay_ms {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = file_cfg.retry_max_delay_ms {
            self.retry_max_delay_ms = v;
        }
        if let Some(v) = file_cfg.max_attachment_bytes {
            self.max_attachment_bytes = v;
        }
        if let Some(v) = file_cfg.recipient_cache_ttl_secs {
            self.recipient_cache_ttl_secs = v;
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PORTAL_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("APP__USER_ID").and_then(|v| v.parse().ok()) {
            self.user_id = Some(v);
        }
        if let Some(v) = lookup("APP__LOAD_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.load_timeout_ms = v;
        }
        if let Some(v) = lookup("APP__LOAD_RETRY_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.load_retry_attempts = v;
        }
        if let Some(v) = lookup("APP__RETRY_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = lookup("APP__RETRY_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.retry_max_delay_ms = v;
        }
        if let Some(v) = lookup("APP__MAX_ATTACHMENT_BYTES").and_then(|v| v.parse().ok()) {
            self.max_attachment_bytes = v;
        }
        if let Some(v) = lookup("APP__RECIPIENT_CACHE_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.recipient_cache_ttl_secs = v;
        }
    }
}

/// Defaults, then `portal.toml` in the working directory, then the environment.
pub fn load_settings() -> anyhow::Result<ClientSettings> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?;
        settings.apply_file(file_cfg);
    }

    settings.apply_env(env_lookup);
    settings.server_url = normalize_server_url(&settings.server_url)?;
    Ok(settings)
}

pub fn normalize_server_url(raw: &str) -> anyhow::Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(ClientSettings::default().server_url);
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let parsed = Url::parse(&with_scheme)
        .with_context(|| format!("invalid server url '{raw}'"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("server_url must use http or https, got {other}")),
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

pub fn websocket_url(server_url: &str, path: &str) -> anyhow::Result<String> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!(
        "{}/{}",
        ws_base.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
