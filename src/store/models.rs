use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Header used for `api_key` servers when none is configured.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

// =============================================================================
// Downstream servers
// =============================================================================

/// How a decrypted credential is attached to outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthType {
    /// No credential is sent.
    None,
    /// Credential sent verbatim in the named header.
    ApiKey { header: String },
    /// Credential sent as `Authorization: Bearer <credential>`.
    BearerToken,
}

impl AuthType {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::ApiKey { .. } => "api_key",
            AuthType::BearerToken => "bearer_token",
        }
    }

    /// Rebuilds an auth type from its persisted kind and optional header name.
    pub fn from_parts(kind: &str, header: Option<String>) -> Option<Self> {
        match kind {
            "none" => Some(AuthType::None),
            "api_key" => Some(AuthType::ApiKey {
                header: header
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
            }),
            "bearer_token" => Some(AuthType::BearerToken),
            _ => None,
        }
    }

    pub fn header_name(&self) -> Option<&str> {
        match self {
            AuthType::ApiKey { header } => Some(header),
            _ => None,
        }
    }

    pub fn requires_credential(&self) -> bool {
        !matches!(self, AuthType::None)
    }
}

/// Per-server circuit breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// A registered third-party tool server.
#[derive(Clone, PartialEq, Eq)]
pub struct DownstreamServer {
    /// Unique, immutable identifier used in gateway URLs and as breaker key.
    pub label: String,
    pub endpoint_url: String,
    pub auth: AuthType,
    /// base64(nonce || ciphertext), see [`crate::gateway::CredentialCipher`].
    pub encrypted_credential: Option<String>,
    pub enabled: bool,
    pub breaker: BreakerSettings,
}

impl fmt::Debug for DownstreamServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamServer")
            .field("label", &self.label)
            .field("endpoint_url", &self.endpoint_url)
            .field("auth", &self.auth.kind())
            .field(
                "encrypted_credential",
                &self.encrypted_credential.as_ref().map(|_| "<redacted>"),
            )
            .field("enabled", &self.enabled)
            .field("breaker", &self.breaker)
            .finish()
    }
}

// =============================================================================
// Trust policy
// =============================================================================

/// Policy tier assigned to a tool invocation. Ordered from least to most strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Auto,
    Review,
    Block,
}

impl TrustTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::Auto => "auto",
            TrustTier::Review => "review",
            TrustTier::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(TrustTier::Auto),
            "review" => Some(TrustTier::Review),
            "block" => Some(TrustTier::Block),
            _ => None,
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRule {
    pub workspace_id: String,
    /// Glob over tool names: `*` any run of characters, `?` exactly one.
    pub pattern: String,
    pub tier: TrustTier,
}

impl TrustRule {
    pub fn new(workspace_id: impl Into<String>, pattern: impl Into<String>, tier: TrustTier) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            pattern: pattern.into(),
            tier,
        }
    }
}

// =============================================================================
// Callers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerRole {
    Admin,
    Agent,
    /// May browse the tool catalog but not invoke tools.
    Observer,
}

impl CallerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerRole::Admin => "admin",
            CallerRole::Agent => "agent",
            CallerRole::Observer => "observer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(CallerRole::Admin),
            "agent" => Some(CallerRole::Agent),
            "observer" => Some(CallerRole::Observer),
            _ => None,
        }
    }

    pub fn can_invoke_tools(&self) -> bool {
        matches!(self, CallerRole::Admin | CallerRole::Agent)
    }
}

/// Authenticated identity on whose behalf a tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub role: CallerRole,
    pub workspace_id: String,
}

// =============================================================================
// Audit
// =============================================================================

/// Final disposition of one gateway invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    UpstreamError,
    RateLimited,
    ServerNotFound,
    CircuitOpen,
    TrustBlocked,
    TrustUnavailable,
    InternalError,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::UpstreamError => "upstream_error",
            AuditResult::RateLimited => "rate_limited",
            AuditResult::ServerNotFound => "server_not_found",
            AuditResult::CircuitOpen => "circuit_open",
            AuditResult::TrustBlocked => "trust_blocked",
            AuditResult::TrustUnavailable => "trust_unavailable",
            AuditResult::InternalError => "internal_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditResult::Success),
            "upstream_error" => Some(AuditResult::UpstreamError),
            "rate_limited" => Some(AuditResult::RateLimited),
            "server_not_found" => Some(AuditResult::ServerNotFound),
            "circuit_open" => Some(AuditResult::CircuitOpen),
            "trust_blocked" => Some(AuditResult::TrustBlocked),
            "trust_unavailable" => Some(AuditResult::TrustUnavailable),
            "internal_error" => Some(AuditResult::InternalError),
            _ => None,
        }
    }
}

/// One audit record. Never carries credentials or downstream payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub caller_id: String,
    pub workspace_id: String,
    pub server_label: String,
    pub tool_name: String,
    pub result: AuditResult,
    pub tier: Option<TrustTier>,
    /// Outcome class reported by the forwarder, when a call went out.
    pub outcome: Option<String>,
    pub latency_ms: Option<i64>,
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(
        request_id: impl Into<String>,
        caller: &Caller,
        server_label: impl Into<String>,
        tool_name: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: Utc::now(),
            caller_id: caller.id.clone(),
            workspace_id: caller.workspace_id.clone(),
            server_label: server_label.into(),
            tool_name: tool_name.into(),
            result,
            tier: None,
            outcome: None,
            latency_ms: None,
            details: None,
        }
    }

    pub fn with_tier(mut self, tier: TrustTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>, latency: Duration) -> Self {
        self.outcome = Some(outcome.into());
        self.latency_ms = Some(latency.as_millis() as i64);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
