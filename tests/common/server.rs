//! Test server lifecycle management
//!
//! Each test gets an isolated gateway with its own registry database and its
//! own fake downstream MCP server.

use super::constants::*;
use super::fixtures::{populate_registry, MockDownstream};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use toolgate_server::gateway::{
    AuditLogger, CircuitBreaker, CredentialCipher, Gateway, GatewaySettings, HttpForwarder,
    RateLimiter, RegistryChange, RegistryChangeSubscriber, RegistryNotifier, TrustClassifier,
    DEFAULT_MAX_RESPONSE_BYTES,
};
use toolgate_server::server::{make_app, RequestsLoggingLevel, ServerConfig};
use toolgate_server::store::SqliteGatewayStore;

#[derive(Default)]
struct RecordingSubscriber {
    changes: Arc<Mutex<Vec<RegistryChange>>>,
}

#[async_trait]
impl RegistryChangeSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_change(&self, change: &RegistryChange) -> anyhow::Result<()> {
        self.changes.lock().unwrap().push(change.clone());
        Ok(())
    }
}

/// Test gateway instance
///
/// When dropped, the server shuts down and the temp database is removed.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// Registry store for direct database access in tests
    pub store: Arc<SqliteGatewayStore>,

    /// The gateway behind the HTTP surface, for breaker inspection
    pub gateway: Arc<Gateway>,

    pub downstream: MockDownstream,

    pub agent_key: String,
    pub observer_key: String,
    pub admin_key: String,

    changes: Arc<Mutex<Vec<RegistryChange>>>,

    // Private fields - keep resources alive until drop
    _temp_db_dir: TempDir,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

pub fn test_settings() -> GatewaySettings {
    GatewaySettings {
        call_timeout: Duration::from_millis(CALL_TIMEOUT_MS),
        list_timeout: Duration::from_millis(CALL_TIMEOUT_MS),
        ..GatewaySettings::default()
    }
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_settings(), 60).await
    }

    /// Spawns a gateway on a random port with the given gateway settings
    /// and failed-authentication allowance.
    ///
    /// # Panics
    ///
    /// Panics if the registry cannot be created, the port cannot be bound,
    /// or the server doesn't become ready in time.
    pub async fn spawn_with(settings: GatewaySettings, auth_attempts_per_minute: u32) -> Self {
        let downstream = MockDownstream::spawn().await;

        let temp_db_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteGatewayStore::new(temp_db_dir.path().join("gateway.db"))
                .expect("Failed to open gateway store"),
        );
        let cipher = Arc::new(
            CredentialCipher::from_base64_key(&CredentialCipher::generate_key())
                .expect("Failed to build cipher"),
        );
        let keys = populate_registry(&store, &cipher, &downstream.base_url)
            .expect("Failed to populate registry");

        let recorder = RecordingSubscriber::default();
        let changes = recorder.changes.clone();
        let notifier = RegistryNotifier::spawn(16, vec![Arc::new(recorder)]);

        let gateway = Arc::new(Gateway::new(
            store.clone(),
            TrustClassifier::new(store.clone(), store.clone()),
            Arc::new(CircuitBreaker::new()),
            Arc::new(RateLimiter::new()),
            Arc::new(
                HttpForwarder::new(cipher, DEFAULT_MAX_RESPONSE_BYTES)
                    .expect("Failed to build forwarder"),
            ),
            AuditLogger::new(store.clone()),
            notifier,
            settings,
        ));

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            port,
            requests_logging_level: RequestsLoggingLevel::None,
            auth_attempts_per_minute,
            ..ServerConfig::default()
        };
        let app = make_app(config, gateway.clone(), store.clone());

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
            .expect("Server failed");
        });

        let server = Self {
            base_url,
            store,
            gateway,
            downstream,
            agent_key: keys.agent,
            observer_key: keys.observer,
            admin_key: keys.admin,
            changes,
            _temp_db_dir: temp_db_dir,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Registry changes delivered so far. Delivery is asynchronous, so this
    /// polls briefly until at least `expected` arrived.
    pub async fn registry_changes(&self, expected: usize) -> Vec<RegistryChange> {
        for _ in 0..50 {
            let changes = self.changes.lock().unwrap().clone();
            if changes.len() >= expected {
                return changes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.changes.lock().unwrap().clone()
    }

    /// Waits for the server to become ready by polling the home endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
