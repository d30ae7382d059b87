//! HTTP client for end-to-end tests
//!
//! Wraps reqwest with one method per gateway endpoint. When routes or
//! request formats change, update only this file.

use super::constants::*;
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;

/// HTTP test client presenting one API key
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
    api_key: Option<String>,
}

impl TestClient {
    pub fn new(base_url: String, api_key: &str) -> Self {
        Self {
            client: Self::build_client(),
            base_url,
            api_key: Some(api_key.to_string()),
        }
    }

    /// A client that sends no `Authorization` header.
    pub fn anonymous(base_url: String) -> Self {
        Self {
            client: Self::build_client(),
            base_url,
            api_key: None,
        }
    }

    fn build_client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client")
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    // ========================================================================
    // Gateway Endpoints
    // ========================================================================

    /// POST /gateway/v1/proxy/{server}/tools/{tool}
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Option<Value>) -> Response {
        let body = match arguments {
            Some(arguments) => json!({ "arguments": arguments }),
            None => json!({}),
        };
        self.call_tool_raw(server, tool, body.to_string()).await
    }

    /// Same endpoint with a verbatim body.
    pub async fn call_tool_raw(&self, server: &str, tool: &str, body: String) -> Response {
        let url = format!(
            "{}/gateway/v1/proxy/{}/tools/{}",
            self.base_url, server, tool
        );
        self.authorize(self.client.post(url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .expect("Tool call request failed")
    }

    /// GET /gateway/v1/tools
    pub async fn list_tools(&self) -> Response {
        let url = format!("{}/gateway/v1/tools", self.base_url);
        self.authorize(self.client.get(url))
            .send()
            .await
            .expect("Tool list request failed")
    }

    /// GET /
    pub async fn home(&self) -> Response {
        self.client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .expect("Home request failed")
    }
}

/// Reads `error.code` from a gateway error response.
pub async fn error_code(response: Response) -> String {
    let body: Value = response.json().await.expect("Error body is not JSON");
    body["error"]["code"]
        .as_str()
        .expect("Error body has no code")
        .to_string()
}
