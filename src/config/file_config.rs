use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,
    pub encryption_key_env: Option<String>,

    // Feature configs
    pub gateway: Option<GatewayConfig>,
    pub notifications: Option<NotificationsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub call_timeout_ms: Option<u64>,
    pub list_timeout_ms: Option<u64>,
    pub max_response_bytes: Option<usize>,
    pub rate_limit_requests: Option<u32>,
    pub rate_limit_window_secs: Option<u64>,
    /// "caller" or "server"
    pub rate_limit_key: Option<String>,
    pub auth_attempts_per_minute: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct NotificationsConfig {
    pub queue_capacity: Option<usize>,
    pub webhook_urls: Option<Vec<String>>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
