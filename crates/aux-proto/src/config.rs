use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub vibe: VibeConfig,
    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// The mediated music service. All URLs are overridable so tests (and
/// self-hosted mocks) can point the daemon at a local server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// OAuth client id registered with the music service.
    #[serde(default)]
    pub client_id: String,
    /// Redirect URI registered for that client. Must route back to
    /// `/api/auth/callback` on this daemon.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Scopes requested during the handshake, space-separated.
    #[serde(default = "default_scopes")]
    pub scopes: String,
    /// Per-request timeout for every upstream call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Committed enqueues allowed per client per window.
    #[serde(default = "default_quota_limit")]
    pub limit: u32,
    /// Window length in minutes.
    #[serde(default = "default_quota_window_minutes")]
    pub window_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum results returned per catalog search.
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibeConfig {
    /// Preset activated at startup ("off" starts with the filter disabled).
    #[serde(default = "default_vibe_preset")]
    pub default_preset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    /// Shared secret for host-only operations (policy changes, logout).
    /// When unset, a random key is generated at startup and logged.
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            redirect_uri: default_redirect_uri(),
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            api_base: default_api_base(),
            scopes: default_scopes(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: default_quota_limit(),
            window_minutes: default_quota_window_minutes(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: default_search_limit(),
        }
    }
}

impl Default for VibeConfig {
    fn default() -> Self {
        Self {
            default_preset: default_vibe_preset(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:8787/api/auth/callback".to_string()
}

fn default_authorize_url() -> String {
    "https://accounts.spotify.com/authorize".to_string()
}

fn default_token_url() -> String {
    "https://accounts.spotify.com/api/token".to_string()
}

fn default_api_base() -> String {
    "https://api.spotify.com/v1".to_string()
}

fn default_scopes() -> String {
    "user-read-currently-playing user-read-playback-state user-modify-playback-state"
        .to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_quota_limit() -> u32 {
    10
}

fn default_quota_window_minutes() -> i64 {
    60
}

fn default_search_limit() -> u32 {
    10
}

fn default_vibe_preset() -> String {
    "off".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
