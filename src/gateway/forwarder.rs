//! Outbound calls to downstream MCP servers.
//!
//! A [`Forwarder`] turns one tool invocation into one JSON-RPC request and
//! classifies whatever comes back. Classification never fails: every network
//! result maps to an [`OutcomeClass`]. [`ForwardError`] is reserved for problems
//! that prevent the request from being sent at all.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::crypto::{CredentialCipher, CredentialError};
use super::protocol::{
    methods, JsonRpcRequest, JsonRpcResponse, Reply, ToolDefinition, ToolsListResult,
};
use crate::store::{AuthType, DownstreamServer};

pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeClass {
    Success,
    /// The downstream rejected the request itself (HTTP 4xx or JSON-RPC error).
    ClientError,
    /// HTTP 5xx, an unparseable body or an oversized body.
    ServerError,
    Timeout,
    Transport,
}

impl OutcomeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Success => "success",
            OutcomeClass::ClientError => "client_error",
            OutcomeClass::ServerError => "server_error",
            OutcomeClass::Timeout => "timeout",
            OutcomeClass::Transport => "transport",
        }
    }

    /// Whether the outcome counts against the server's circuit.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            OutcomeClass::ServerError | OutcomeClass::Timeout | OutcomeClass::Transport
        )
    }
}

/// Result of one outbound exchange. `payload` is only present on success.
#[derive(Debug, Clone)]
pub struct Outcome<T = Value> {
    pub class: OutcomeClass,
    pub latency: Duration,
    pub payload: Option<T>,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        self.class == OutcomeClass::Success
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("server {0} requires a credential but none is stored")]
    MissingCredential(String),
    #[error("credential for server {server} is unusable")]
    Credential {
        server: String,
        #[source]
        source: CredentialError,
    },
    #[error("server {server} has an invalid endpoint: {reason}")]
    InvalidEndpoint { server: String, reason: String },
    #[error("server {0} has an invalid credential header name")]
    InvalidAuthHeader(String),
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Sends `tools/call` for `tool_name`, bounded by `deadline`.
    async fn forward(
        &self,
        server: &DownstreamServer,
        tool_name: &str,
        arguments: &Value,
        deadline: Duration,
    ) -> Result<Outcome, ForwardError>;

    /// Sends `tools/list`, bounded by `deadline`.
    async fn list_tools(
        &self,
        server: &DownstreamServer,
        deadline: Duration,
    ) -> Result<Outcome<Vec<ToolDefinition>>, ForwardError>;
}

/// Speaks MCP's streamable HTTP transport: one JSON-RPC POST per call.
pub struct HttpForwarder {
    client: reqwest::Client,
    cipher: Arc<CredentialCipher>,
    max_response_bytes: usize,
    next_request_id: AtomicU64,
}

impl HttpForwarder {
    pub fn new(cipher: Arc<CredentialCipher>, max_response_bytes: usize) -> anyhow::Result<Self> {
        // Redirects are not followed: the credential header would travel with them.
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolgate/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            cipher,
            max_response_bytes,
            next_request_id: AtomicU64::new(1),
        })
    }

    fn endpoint(&self, server: &DownstreamServer) -> Result<Url, ForwardError> {
        let url = Url::parse(&server.endpoint_url).map_err(|e| ForwardError::InvalidEndpoint {
            server: server.label.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ForwardError::InvalidEndpoint {
                server: server.label.clone(),
                reason: format!("unsupported scheme {}", other),
            }),
        }
    }

    fn auth_headers(&self, server: &DownstreamServer) -> Result<HeaderMap, ForwardError> {
        let mut headers = HeaderMap::new();
        if !server.auth.requires_credential() {
            return Ok(headers);
        }

        let blob = server
            .encrypted_credential
            .as_deref()
            .ok_or_else(|| ForwardError::MissingCredential(server.label.clone()))?;
        let credential = self
            .cipher
            .decrypt(blob)
            .map_err(|source| ForwardError::Credential {
                server: server.label.clone(),
                source,
            })?;

        let (name, raw_value) = match &server.auth {
            AuthType::None => return Ok(headers),
            AuthType::ApiKey { header } => (
                HeaderName::from_bytes(header.as_bytes())
                    .map_err(|_| ForwardError::InvalidAuthHeader(server.label.clone()))?,
                credential.expose().to_string(),
            ),
            AuthType::BearerToken => (AUTHORIZATION, format!("Bearer {}", credential.expose())),
        };
        let mut value =
            HeaderValue::from_str(&raw_value).map_err(|_| ForwardError::Credential {
                server: server.label.clone(),
                source: CredentialError::Malformed,
            })?;
        value.set_sensitive(true);
        headers.insert(name, value);
        Ok(headers)
    }

    /// Sends one request and classifies the reply. Returns the JSON-RPC result
    /// only when the class is `Success`.
    async fn exchange(
        &self,
        server: &DownstreamServer,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Outcome, ForwardError> {
        let url = self.endpoint(server)?;
        let headers = self.auth_headers(server)?;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let started = Instant::now();
        let result =
            tokio::time::timeout(deadline, self.send_and_read(url, headers, &request)).await;
        let latency = started.elapsed();

        let (class, payload) = match result {
            Err(_) => (OutcomeClass::Timeout, None),
            Ok(Err(class)) => (class, None),
            Ok(Ok(body)) => classify_body(&server.label, &body, id),
        };

        debug!(
            "{} {} -> {} in {}ms",
            server.label,
            method,
            class.as_str(),
            latency.as_millis()
        );
        Ok(Outcome {
            class,
            latency,
            payload,
        })
    }

    async fn send_and_read(
        &self,
        url: Url,
        headers: HeaderMap,
        request: &JsonRpcRequest<'_>,
    ) -> Result<Vec<u8>, OutcomeClass> {
        let mut response = self
            .client
            .post(url)
            .headers(headers)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                let class = transport_class(&e);
                debug!("Downstream request failed: {}", e.without_url());
                class
            })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(OutcomeClass::ClientError);
        }
        if !status.is_success() {
            return Err(OutcomeClass::ServerError);
        }

        if let Some(length) = response.content_length() {
            if length > self.max_response_bytes as u64 {
                warn!(
                    "Downstream response too large ({:#})",
                    byte_unit::Byte::from(length)
                );
                return Err(OutcomeClass::ServerError);
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| transport_class(&e))? {
            if body.len() + chunk.len() > self.max_response_bytes {
                warn!(
                    "Downstream response exceeded {:#}",
                    byte_unit::Byte::from(self.max_response_bytes as u64)
                );
                return Err(OutcomeClass::ServerError);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn transport_class(e: &reqwest::Error) -> OutcomeClass {
    if e.is_timeout() {
        OutcomeClass::Timeout
    } else {
        OutcomeClass::Transport
    }
}

fn classify_body(label: &str, body: &[u8], id: u64) -> (OutcomeClass, Option<Value>) {
    trace!("{} replied: {}", label, String::from_utf8_lossy(body));
    let response: JsonRpcResponse = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(_) => return (OutcomeClass::ServerError, None),
    };
    match response.into_reply(id) {
        Reply::Result(result) => (OutcomeClass::Success, Some(result)),
        Reply::Error { code } => {
            debug!("{} returned JSON-RPC error {}", label, code);
            (OutcomeClass::ClientError, None)
        }
        Reply::Malformed => (OutcomeClass::ServerError, None),
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        server: &DownstreamServer,
        tool_name: &str,
        arguments: &Value,
        deadline: Duration,
    ) -> Result<Outcome, ForwardError> {
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        self.exchange(server, methods::TOOLS_CALL, params, deadline)
            .await
    }

    async fn list_tools(
        &self,
        server: &DownstreamServer,
        deadline: Duration,
    ) -> Result<Outcome<Vec<ToolDefinition>>, ForwardError> {
        let outcome = self
            .exchange(server, methods::TOOLS_LIST, serde_json::json!({}), deadline)
            .await?;

        let Some(result) = outcome.payload else {
            return Ok(Outcome {
                class: outcome.class,
                latency: outcome.latency,
                payload: None,
            });
        };
        match serde_json::from_value::<ToolsListResult>(result) {
            Ok(list) => Ok(Outcome {
                class: OutcomeClass::Success,
                latency: outcome.latency,
                payload: Some(list.tools),
            }),
            Err(e) => {
                debug!("{} returned an unusable tool list: {}", server.label, e);
                Ok(Outcome {
                    class: OutcomeClass::ServerError,
                    latency: outcome.latency,
                    payload: None,
                })
            }
        }
    }
}
