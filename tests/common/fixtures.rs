//! Test fixtures: a fake downstream MCP server and a populated registry.

use super::constants::*;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use toolgate_server::gateway::CredentialCipher;
use toolgate_server::store::{
    AuthType, BreakerSettings, CallerRole, DownstreamServer, SqliteGatewayStore, TrustRule,
    TrustTier,
};

#[derive(Clone, Default)]
struct MockState {
    calls: Arc<Mutex<Vec<String>>>,
}

/// A minimal MCP server. `POST /mcp` answers `tools/list` and `tools/call`
/// for bearer-authenticated requests, `POST /down` always fails.
pub struct MockDownstream {
    pub base_url: String,
    state: MockState,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

fn rpc_result(id: Value, result: Value) -> Response {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
}

fn rpc_error(id: Value, code: i64, message: &str) -> Response {
    Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}))
        .into_response()
}

async fn mcp(State(state): State<MockState>, headers: HeaderMap, Json(req): Json<Value>) -> Response {
    let expected = format!("Bearer {}", DOWNSTREAM_TOKEN);
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str());
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let id = req["id"].clone();
    match req["method"].as_str() {
        Some("tools/list") => rpc_result(
            id,
            json!({"tools": [
                {
                    "name": ECHO_TOOL,
                    "description": "Echoes its arguments",
                    "inputSchema": {"type": "object"}
                },
                {"name": SLOW_TOOL},
                {"name": DANGER_TOOL, "description": "Deletes everything"}
            ]}),
        ),
        Some("tools/call") => {
            let name = req["params"]["name"].as_str().unwrap_or_default().to_string();
            state.calls.lock().unwrap().push(name.clone());
            match name.as_str() {
                ECHO_TOOL => rpc_result(id, json!({"echo": req["params"]["arguments"]})),
                SLOW_TOOL => {
                    tokio::time::sleep(Duration::from_millis(SLOW_TOOL_DELAY_MS)).await;
                    rpc_result(id, json!({"done": true}))
                }
                DANGER_TOOL => rpc_result(id, json!({"deleted": true})),
                _ => rpc_error(id, -32602, "Unknown tool: internal detail"),
            }
        }
        _ => rpc_error(id, -32601, "Method not found"),
    }
}

async fn always_down() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "downstream exploded").into_response()
}

impl MockDownstream {
    pub async fn spawn() -> Self {
        let state = MockState::default();
        let app = Router::new()
            .route("/mcp", post(mcp))
            .route("/down", post(always_down))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock downstream");
        let port = listener.local_addr().expect("No local address").port();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Mock downstream failed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            state,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Names of the tools invoked so far, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == tool).count()
    }
}

impl Drop for MockDownstream {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Plaintext API keys of the fixture callers.
pub struct CallerKeys {
    pub agent: String,
    pub observer: String,
    pub admin: String,
}

/// Registers the fixture servers, rules and callers.
pub fn populate_registry(
    store: &SqliteGatewayStore,
    cipher: &CredentialCipher,
    downstream_url: &str,
) -> anyhow::Result<CallerKeys> {
    store.upsert_server(&DownstreamServer {
        label: TOOLS_SERVER.to_string(),
        endpoint_url: format!("{}/mcp", downstream_url),
        auth: AuthType::BearerToken,
        encrypted_credential: Some(cipher.encrypt(DOWNSTREAM_TOKEN)?),
        enabled: true,
        breaker: BreakerSettings::default(),
    })?;
    store.upsert_server(&DownstreamServer {
        label: FLAKY_SERVER.to_string(),
        endpoint_url: format!("{}/down", downstream_url),
        auth: AuthType::None,
        encrypted_credential: None,
        enabled: true,
        breaker: BreakerSettings {
            failure_threshold: FLAKY_FAILURE_THRESHOLD,
            open_duration: Duration::from_secs(60),
        },
    })?;
    store.upsert_server(&DownstreamServer {
        label: DISABLED_SERVER.to_string(),
        endpoint_url: format!("{}/mcp", downstream_url),
        auth: AuthType::None,
        encrypted_credential: None,
        enabled: false,
        breaker: BreakerSettings::default(),
    })?;

    store.upsert_trust_rule(&TrustRule::new(
        RESTRICTED_WORKSPACE,
        ECHO_TOOL,
        TrustTier::Auto,
    ))?;
    store.upsert_trust_rule(&TrustRule::new(
        RESTRICTED_WORKSPACE,
        "danger_*",
        TrustTier::Block,
    ))?;
    store.upsert_trust_rule(&TrustRule::new(OPEN_WORKSPACE, "*", TrustTier::Auto))?;
    store.set_default_tier(TrustTier::Review)?;

    Ok(CallerKeys {
        agent: store.create_api_key(AGENT_ID, CallerRole::Agent, RESTRICTED_WORKSPACE)?,
        observer: store.create_api_key(OBSERVER_ID, CallerRole::Observer, RESTRICTED_WORKSPACE)?,
        admin: store.create_api_key(ADMIN_ID, CallerRole::Admin, OPEN_WORKSPACE)?,
    })
}
