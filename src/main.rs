use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::{fmt::Debug, path::PathBuf};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use toolgate_server::config;
use toolgate_server::gateway::{
    AuditLogger, CircuitBreaker, CredentialCipher, Gateway, HttpForwarder, LogSubscriber,
    RateLimiter, RegistryChangeSubscriber, RegistryNotifier, TrustClassifier, WebhookSubscriber,
};
use toolgate_server::server::{metrics, run_server, RequestsLoggingLevel};
use toolgate_server::store::SqliteGatewayStore;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing the gateway database (gateway.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3100)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9191)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Environment variable holding the base64 credential encryption key.
    #[clap(long)]
    pub encryption_key_env: Option<String>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            metrics_port: args.metrics_port,
            logging_level: args.logging_level.clone(),
            encryption_key_env: args.encryption_key_env.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  port: {}", app_config.port);
    info!("  rate limit key: {:?}", app_config.gateway.rate_limit_key);

    // The key is loaded before anything else touches the store
    let cipher = Arc::new(CredentialCipher::from_env(&app_config.encryption_key_env)?);

    if !app_config.gateway_db_path().exists() {
        info!(
            "Creating new gateway database at {:?}",
            app_config.gateway_db_path()
        );
    }
    let store = Arc::new(SqliteGatewayStore::new(app_config.gateway_db_path())?);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let mut subscribers: Vec<Arc<dyn RegistryChangeSubscriber>> = vec![Arc::new(LogSubscriber)];
    for url in &app_config.notifications.webhook_urls {
        info!("Registry changes will be posted to {}", url);
        subscribers.push(Arc::new(WebhookSubscriber::new(url.clone())?));
    }
    let notifier = RegistryNotifier::spawn(app_config.notifications.queue_capacity, subscribers);

    let forwarder = Arc::new(HttpForwarder::new(cipher, app_config.max_response_bytes)?);
    let gateway = Gateway::new(
        store.clone(),
        TrustClassifier::new(store.clone(), store.clone()),
        Arc::new(CircuitBreaker::new()),
        Arc::new(RateLimiter::new()),
        forwarder,
        AuditLogger::new(store.clone()),
        notifier,
        app_config.gateway.clone(),
    );

    run_server(app_config.server_config(), Arc::new(gateway), store).await
}
