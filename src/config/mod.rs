mod file_config;

pub use file_config::{FileConfig, GatewayConfig, NotificationsConfig};

use crate::gateway::{GatewaySettings, RateLimitKey, DEFAULT_MAX_RESPONSE_BYTES};
use crate::server::{RequestsLoggingLevel, ServerConfig};
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ENCRYPTION_KEY_ENV: &str = "TOOLGATE_ENCRYPTION_KEY";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub encryption_key_env: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    /// Name of the environment variable holding the credential key.
    pub encryption_key_env: String,

    // Feature configs (with defaults)
    pub gateway: GatewaySettings,
    pub max_response_bytes: usize,
    pub auth_attempts_per_minute: u32,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub queue_capacity: usize,
    pub webhook_urls: Vec<String>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            queue_capacity: crate::gateway::DEFAULT_QUEUE_CAPACITY,
            webhook_urls: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        if port == metrics_port {
            bail!("port and metrics_port must differ (both {})", port);
        }

        let logging_level = match file.logging_level {
            Some(s) => match parse_logging_level(&s) {
                Some(level) => level,
                None => bail!("Invalid logging_level: {}", s),
            },
            None => cli.logging_level.clone(),
        };

        let encryption_key_env = file
            .encryption_key_env
            .or_else(|| cli.encryption_key_env.clone())
            .unwrap_or_else(|| DEFAULT_ENCRYPTION_KEY_ENV.to_string());
        if encryption_key_env.trim().is_empty() {
            bail!("encryption_key_env must not be empty");
        }

        // Gateway settings - merge file config with defaults
        let gw_file = file.gateway.unwrap_or_default();
        let defaults = GatewaySettings::default();
        let rate_limit_key = match gw_file.rate_limit_key {
            Some(s) => match RateLimitKey::parse(&s) {
                Some(key) => key,
                None => bail!("Invalid rate_limit_key '{}', expected caller or server", s),
            },
            None => defaults.rate_limit_key,
        };
        let gateway = GatewaySettings {
            call_timeout: gw_file
                .call_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_timeout),
            list_timeout: gw_file
                .list_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.list_timeout),
            rate_limit_requests: gw_file
                .rate_limit_requests
                .unwrap_or(defaults.rate_limit_requests),
            rate_limit_window: gw_file
                .rate_limit_window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_key,
        };
        if gateway.call_timeout.is_zero() || gateway.list_timeout.is_zero() {
            bail!("Gateway timeouts must be greater than zero");
        }
        if gateway.rate_limit_requests == 0 {
            bail!("rate_limit_requests must be greater than zero");
        }
        if gateway.rate_limit_window.is_zero() {
            bail!("rate_limit_window_secs must be greater than zero");
        }

        let max_response_bytes = gw_file
            .max_response_bytes
            .unwrap_or(DEFAULT_MAX_RESPONSE_BYTES);
        if max_response_bytes == 0 {
            bail!("max_response_bytes must be greater than zero");
        }
        let auth_attempts_per_minute = gw_file.auth_attempts_per_minute.unwrap_or(60);
        if auth_attempts_per_minute == 0 {
            bail!("auth_attempts_per_minute must be greater than zero");
        }

        let nt_file = file.notifications.unwrap_or_default();
        let notifications = NotificationSettings {
            queue_capacity: nt_file
                .queue_capacity
                .unwrap_or(crate::gateway::DEFAULT_QUEUE_CAPACITY),
            webhook_urls: nt_file.webhook_urls.unwrap_or_default(),
        };
        if notifications.queue_capacity == 0 {
            bail!("queue_capacity must be greater than zero");
        }
        for url in &notifications.webhook_urls {
            if reqwest::Url::parse(url).is_err() {
                bail!("Invalid webhook URL: {}", url);
            }
        }

        Ok(Self {
            db_dir,
            port,
            metrics_port,
            logging_level,
            encryption_key_env,
            gateway,
            max_response_bytes,
            auth_attempts_per_minute,
            notifications,
        })
    }

    pub fn gateway_db_path(&self) -> PathBuf {
        self.db_dir.join("gateway.db")
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            requests_logging_level: self.logging_level.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            auth_attempts_per_minute: self.auth_attempts_per_minute,
        }
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
