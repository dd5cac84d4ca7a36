use std::{fs, io, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::error::SettingsError;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Exponential backoff for a 1-based attempt number, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub websocket_path: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub receipt_queue_limit: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            websocket_path: "/ws".into(),
            page_size: 50,
            request_timeout: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
            receipt_queue_limit: 256,
        }
    }
}

impl ClientSettings {
    /// Websocket endpoint derived from the HTTP server url.
    pub fn websocket_url(&self) -> Result<Url, SettingsError> {
        let server_url = self.server_url.trim_end_matches('/');
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(SettingsError::InvalidServerUrl(self.server_url.clone()));
        };
        Url::parse(&format!("{ws_url}{}", self.websocket_path))
            .map_err(|_| SettingsError::InvalidServerUrl(self.server_url.clone()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    websocket_path: Option<String>,
    page_size: Option<u32>,
    request_timeout_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    receipt_queue_limit: Option<usize>,
}

pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

/// Defaults, then the settings file if present, then environment overrides.
pub fn load_settings_from(path: &Path) -> Result<ClientSettings, SettingsError> {
    let mut settings = ClientSettings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg: FileSettings =
                toml::from_str(&raw).map_err(|source| SettingsError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            apply_file_settings(&mut settings, file_cfg);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.page_size = settings.page_size.clamp(1, MAX_PAGE_SIZE);
    settings.websocket_url()?;
    Ok(settings)
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.websocket_path {
        settings.websocket_path = v;
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.request_timeout_ms {
        settings.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_attempts {
        settings.reconnect.max_attempts = v;
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.reconnect.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.receipt_queue_limit {
        settings.receipt_queue_limit = v;
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("COLLAB_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__WEBSOCKET_PATH") {
        settings.websocket_path = v;
    }
    if let Some(v) = var("APP__PAGE_SIZE").and_then(|v| v.parse().ok()) {
        settings.page_size = v;
    }
    if let Some(v) = var("APP__REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = var("APP__RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.reconnect.max_attempts = v;
    }
    if let Some(v) = var("APP__RECONNECT_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = var("APP__RECONNECT_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = var("APP__RECEIPT_QUEUE_LIMIT").and_then(|v| v.parse().ok()) {
        settings.receipt_queue_limit = v;
    }
}
