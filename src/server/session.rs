use super::state::ServerState;
use crate::gateway::{retry_after_secs, GatewayError};
use crate::server::metrics;
use crate::store::Caller;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error};

const AUTH_WINDOW: Duration = Duration::from_secs(60);

/// The caller resolved from `Authorization: Bearer <api key>`.
#[derive(Debug, Clone)]
pub struct AuthenticatedCaller(pub Caller);

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn client_ip(parts: &Parts) -> String {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl FromRequestParts<ServerState> for AuthenticatedCaller {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        let limit = ctx.config.auth_attempts_per_minute;
        let attempts_key = format!("login:{}", client_ip(parts));

        // Only failed attempts are counted, but an exhausted client is refused outright
        if let Err(wait) = ctx.auth_limiter.check(&attempts_key, limit, AUTH_WINDOW) {
            metrics::record_rate_limit_hit("login");
            return Err(GatewayError::RateLimited {
                retry_after_secs: retry_after_secs(wait),
            });
        }

        let caller = match extract_bearer_token(&parts.headers) {
            None => None,
            Some(token) => match ctx.caller_store.caller_for_api_key(token) {
                Ok(caller) => caller,
                Err(e) => {
                    error!("Failed to resolve API key: {:#}", e);
                    return Err(GatewayError::Internal);
                }
            },
        };

        match caller {
            Some(caller) => {
                debug!("Authenticated caller {} ({})", caller.id, caller.role.as_str());
                Ok(AuthenticatedCaller(caller))
            }
            None => {
                debug!("Rejected credentials from {}", attempts_key);
                let _ = ctx
                    .auth_limiter
                    .check_and_record(&attempts_key, limit, AUTH_WINDOW);
                Err(GatewayError::Unauthorized)
            }
        }
    }
}
