use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::session::AuthenticatedCaller;
use super::state::{GuardedGateway, ServerState};
use crate::gateway::{GatewayError, InvocationRequest};

#[derive(Deserialize, Debug, Default)]
struct ProxyBody {
    #[serde(default)]
    arguments: Option<Value>,
}

/// An empty body means no arguments. Otherwise `arguments`, when present,
/// must be a JSON object.
fn parse_arguments(body: &[u8]) -> Result<Value, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    let parsed: ProxyBody = serde_json::from_slice(body)
        .map_err(|_| GatewayError::InvalidRequest("body is not valid JSON".to_string()))?;
    match parsed.arguments {
        None | Some(Value::Null) => Ok(json!({})),
        Some(arguments @ Value::Object(_)) => Ok(arguments),
        Some(_) => Err(GatewayError::InvalidRequest(
            "arguments must be an object".to_string(),
        )),
    }
}

async fn proxy_tool_call(
    State(gateway): State<GuardedGateway>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path((server_label, tool_name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    if !caller.role.can_invoke_tools() {
        debug!(
            "Caller {} with role {} may not invoke tools",
            caller.id,
            caller.role.as_str()
        );
        return Err(GatewayError::Forbidden);
    }
    let arguments = parse_arguments(&body)?;

    let result = gateway
        .invoke(InvocationRequest {
            caller,
            server_label,
            tool_name,
            arguments,
        })
        .await?;
    Ok(Json(json!({ "result": result })))
}

async fn list_tools(
    State(gateway): State<GuardedGateway>,
    AuthenticatedCaller(_caller): AuthenticatedCaller,
) -> Result<Json<Value>, GatewayError> {
    let tools = gateway.list_tools().await?;
    Ok(Json(json!({ "tools": tools })))
}

pub fn make_gateway_routes(state: ServerState) -> Router {
    Router::new()
        .route(
            "/proxy/{server_label}/tools/{tool_name}",
            post(proxy_tool_call),
        )
        .route("/tools", get(list_tools))
        .with_state(state)
}
