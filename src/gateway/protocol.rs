//! Outbound MCP message types.
//!
//! MCP is JSON-RPC 2.0 with specific method names. Only the subset the gateway
//! sends (`tools/call`, `tools/list`) is modelled.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

pub mod methods {
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Shape of a decoded downstream reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(Value),
    Error { code: i64 },
    /// Not a JSON-RPC 2.0 response to our request.
    Malformed,
}

impl JsonRpcResponse {
    /// Classifies the response as a reply to request `expected_id`.
    pub fn into_reply(self, expected_id: u64) -> Reply {
        if self.jsonrpc != JSONRPC_VERSION {
            return Reply::Malformed;
        }
        if let Some(id) = &self.id {
            if id.as_u64() != Some(expected_id) && !id.is_null() {
                return Reply::Malformed;
            }
        }
        match (self.result, self.error) {
            (Some(result), None) => Reply::Result(result),
            (None, Some(error)) => Reply::Error { code: error.code },
            _ => Reply::Malformed,
        }
    }
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDefinition>,
}
