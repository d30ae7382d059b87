use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::AuditResult;

/// Every way a gateway request can fail, as seen by the caller.
///
/// Messages are deliberately generic. Downstream bodies, credentials and
/// breaker counters never end up in a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("missing or invalid API key")]
    Unauthorized,
    #[error("caller role may not perform this operation")]
    Forbidden,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("server not found")]
    ServerNotFound,
    #[error("circuit open")]
    CircuitOpen { retry_after_secs: u64 },
    #[error("tool blocked by trust policy")]
    TrustBlocked,
    #[error("trust classification unavailable")]
    TrustUnavailable,
    #[error("upstream call failed")]
    Upstream { timeout: bool },
    #[error("internal error")]
    Internal,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::Forbidden => "FORBIDDEN",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::ServerNotFound => "SERVER_NOT_FOUND",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::TrustBlocked => "TRUST_BLOCKED",
            GatewayError::TrustUnavailable => "TRUST_UNAVAILABLE",
            GatewayError::Upstream { .. } => "UPSTREAM_ERROR",
            GatewayError::Internal => "INTERNAL_ERROR",
        }
    }

    /// Caller-facing text.
    pub fn message(&self) -> String {
        match self {
            GatewayError::InvalidRequest(reason) => format!("Invalid request: {}", reason),
            GatewayError::Unauthorized => "Missing or invalid API key".to_string(),
            GatewayError::Forbidden => "Not allowed to invoke tools".to_string(),
            GatewayError::RateLimited { .. } => "Rate limit exceeded".to_string(),
            GatewayError::ServerNotFound => "Unknown or disabled server".to_string(),
            GatewayError::CircuitOpen { .. } => "Server temporarily unavailable".to_string(),
            GatewayError::TrustBlocked => "Tool blocked by workspace policy".to_string(),
            GatewayError::TrustUnavailable => "Tool policy could not be evaluated".to_string(),
            GatewayError::Upstream { timeout: true } => "Upstream server timed out".to_string(),
            GatewayError::Upstream { timeout: false } => "Upstream server error".to_string(),
            GatewayError::Internal => "Internal error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden | GatewayError::TrustBlocked => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServerNotFound => StatusCode::NOT_FOUND,
            GatewayError::CircuitOpen { .. } | GatewayError::TrustUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Upstream { timeout: true } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { timeout: false } => StatusCode::BAD_GATEWAY,
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs }
            | GatewayError::CircuitOpen { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Audit classification for errors produced inside an invocation.
    pub fn audit_result(&self) -> AuditResult {
        match self {
            GatewayError::RateLimited { .. } => AuditResult::RateLimited,
            GatewayError::ServerNotFound => AuditResult::ServerNotFound,
            GatewayError::CircuitOpen { .. } => AuditResult::CircuitOpen,
            GatewayError::TrustBlocked => AuditResult::TrustBlocked,
            GatewayError::TrustUnavailable => AuditResult::TrustUnavailable,
            GatewayError::Upstream { .. } => AuditResult::UpstreamError,
            GatewayError::InvalidRequest(_)
            | GatewayError::Unauthorized
            | GatewayError::Forbidden
            | GatewayError::Internal => AuditResult::InternalError,
        }
    }
}

/// Whole seconds for a `Retry-After` header, never zero.
pub fn retry_after_secs(wait: std::time::Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        }));
        let mut response = (self.status(), body).into_response();
        if let Some(secs) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
