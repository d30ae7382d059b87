//! The invocation pipeline.
//!
//! Every tool call walks the same ordered checks: rate limit, server lookup,
//! circuit breaker, trust policy. Only then is the downstream contacted. The
//! forward, the breaker report and the audit record run in a detached task so
//! a caller that hangs up cannot leave the breaker or the audit trail behind.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::audit::AuditLogger;
use super::circuit_breaker::{Admission, BreakerToken, CircuitBreaker};
use super::error::{retry_after_secs, GatewayError};
use super::forwarder::{Forwarder, OutcomeClass};
use super::notifier::{RegistryChange, RegistryNotifier};
use super::rate_limit::RateLimiter;
use super::trust::TrustClassifier;
use crate::server::metrics;
use crate::store::{AuditEntry, AuditResult, Caller, DownstreamServer, ServerStore, TrustTier};

/// What a tool-call quota is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitKey {
    #[default]
    Caller,
    Server,
}

impl RateLimitKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "caller" => Some(RateLimitKey::Caller),
            "server" => Some(RateLimitKey::Server),
            _ => None,
        }
    }

    pub fn scope(&self) -> &'static str {
        match self {
            RateLimitKey::Caller => "api",
            RateLimitKey::Server => "gateway",
        }
    }

    pub fn bucket_key(&self, caller: &Caller, server_label: &str) -> String {
        match self {
            RateLimitKey::Caller => format!("api:{}", caller.id),
            RateLimitKey::Server => format!("gateway:{}", server_label),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub call_timeout: Duration,
    pub list_timeout: Duration,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_key: RateLimitKey,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            list_timeout: Duration::from_secs(5),
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_key: RateLimitKey::Caller,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub caller: Caller,
    pub server_label: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// One tool as advertised in the aggregated catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub server: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Metric label for invocations rejected before a registered server was found.
pub const UNRESOLVED_SERVER_LABEL: &str = "unknown";

pub struct Gateway {
    servers: Arc<dyn ServerStore>,
    classifier: TrustClassifier,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    forwarder: Arc<dyn Forwarder>,
    audit: AuditLogger,
    notifier: RegistryNotifier,
    settings: GatewaySettings,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        servers: Arc<dyn ServerStore>,
        classifier: TrustClassifier,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        forwarder: Arc<dyn Forwarder>,
        audit: AuditLogger,
        notifier: RegistryNotifier,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            servers,
            classifier,
            breaker,
            limiter,
            forwarder,
            audit,
            notifier,
            settings,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Runs one tool invocation through the full pipeline.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<Value, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let mut resolved = None;

        let result = self.process(&request_id, request, &mut resolved).await;

        // Caller-supplied labels never become series, only registered ones.
        let label = resolved.as_deref().unwrap_or(UNRESOLVED_SERVER_LABEL);
        match &result {
            Ok(_) => metrics::record_invocation(label, "OK"),
            Err(e) => metrics::record_invocation(label, e.code()),
        }
        result
    }

    async fn process(
        &self,
        request_id: &str,
        request: InvocationRequest,
        resolved: &mut Option<String>,
    ) -> Result<Value, GatewayError> {
        let bucket = self
            .settings
            .rate_limit_key
            .bucket_key(&request.caller, &request.server_label);
        if let Err(wait) = self.limiter.check_and_record(
            &bucket,
            self.settings.rate_limit_requests,
            self.settings.rate_limit_window,
        ) {
            metrics::record_rate_limit_hit(self.settings.rate_limit_key.scope());
            debug!("Rate limit hit for {}", bucket);
            return Err(self.reject(
                request_id,
                &request,
                GatewayError::RateLimited {
                    retry_after_secs: retry_after_secs(wait),
                },
                None,
            ));
        }

        let server = match self.servers.get_by_label(&request.server_label) {
            Ok(Some(server)) if server.enabled => server,
            Ok(_) => {
                return Err(self.reject(request_id, &request, GatewayError::ServerNotFound, None))
            }
            Err(e) => {
                error!("Failed to look up server {}: {:#}", request.server_label, e);
                return Err(self.reject(request_id, &request, GatewayError::Internal, None));
            }
        };
        *resolved = Some(server.label.clone());

        let token = match self.breaker.allow(&server.label, server.breaker) {
            Admission::Permitted(token) => token,
            Admission::Rejected { retry_after } => {
                return Err(self.reject(
                    request_id,
                    &request,
                    GatewayError::CircuitOpen {
                        retry_after_secs: retry_after_secs(retry_after),
                    },
                    None,
                ));
            }
        };

        let tier = match self
            .classifier
            .classify(&request.caller.workspace_id, &request.tool_name)
        {
            Ok(TrustTier::Block) => {
                self.breaker.release(token);
                info!(
                    "Blocked {} on {} for workspace {}",
                    request.tool_name, server.label, request.caller.workspace_id
                );
                return Err(self.reject(
                    request_id,
                    &request,
                    GatewayError::TrustBlocked,
                    Some(TrustTier::Block),
                ));
            }
            Ok(tier) => tier,
            Err(e) => {
                self.breaker.release(token);
                warn!("Refusing {} on {}: {}", request.tool_name, server.label, e);
                return Err(self.reject(
                    request_id,
                    &request,
                    GatewayError::TrustUnavailable,
                    None,
                ));
            }
        };

        if tier == TrustTier::Review {
            info!(
                "Forwarding {} on {} flagged for review (request {})",
                request.tool_name, server.label, request_id
            );
        }

        let call = DetachedCall {
            request_id: request_id.to_string(),
            request,
            server,
            tier,
            token,
            deadline: self.settings.call_timeout,
            forwarder: self.forwarder.clone(),
            breaker: self.breaker.clone(),
            audit: self.audit.clone(),
            notifier: self.notifier.clone(),
        };
        match tokio::spawn(call.run()).await {
            Ok(result) => result,
            Err(e) => {
                error!("Forwarding task for request {} failed: {}", request_id, e);
                Err(GatewayError::Internal)
            }
        }
    }

    fn reject(
        &self,
        request_id: &str,
        request: &InvocationRequest,
        error: GatewayError,
        tier: Option<TrustTier>,
    ) -> GatewayError {
        let mut entry = AuditEntry::new(
            request_id,
            &request.caller,
            &request.server_label,
            &request.tool_name,
            error.audit_result(),
        );
        if let Some(tier) = tier {
            entry = entry.with_tier(tier);
        }
        self.audit.record(&entry);
        error
    }

    /// Aggregates `tools/list` across enabled servers whose circuit admits a
    /// call. Servers that fail or are open are left out.
    pub async fn list_tools(&self) -> Result<Vec<CatalogEntry>, GatewayError> {
        let servers = self.servers.list().map_err(|e| {
            error!("Failed to list servers: {:#}", e);
            GatewayError::Internal
        })?;

        let mut handles = Vec::new();
        for server in servers.into_iter().filter(|s| s.enabled) {
            let token = match self.breaker.allow(&server.label, server.breaker) {
                Admission::Permitted(token) => token,
                Admission::Rejected { .. } => {
                    debug!("Skipping server {} in catalog, circuit open", server.label);
                    continue;
                }
            };
            let listing = DetachedListing {
                server,
                token,
                deadline: self.settings.list_timeout,
                forwarder: self.forwarder.clone(),
                breaker: self.breaker.clone(),
                notifier: self.notifier.clone(),
            };
            handles.push(tokio::spawn(listing.run()));
        }

        let mut catalog = Vec::new();
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(entries) => catalog.extend(entries),
                Err(e) => warn!("Tool listing task failed: {}", e),
            }
        }
        Ok(catalog)
    }
}

fn report_outcome(
    breaker: &CircuitBreaker,
    notifier: &RegistryNotifier,
    server: &DownstreamServer,
    token: BreakerToken,
    class: OutcomeClass,
) {
    if let Some(transition) = breaker.report(token, !class.is_breaker_failure()) {
        metrics::record_breaker_transition(&server.label, transition.as_str());
        if let Some(change) = RegistryChange::from_transition(&server.label, transition) {
            notifier.publish(change);
        }
    }
}

/// Forward, breaker report and audit for one admitted invocation.
struct DetachedCall {
    request_id: String,
    request: InvocationRequest,
    server: DownstreamServer,
    tier: TrustTier,
    token: BreakerToken,
    deadline: Duration,
    forwarder: Arc<dyn Forwarder>,
    breaker: Arc<CircuitBreaker>,
    audit: AuditLogger,
    notifier: RegistryNotifier,
}

impl DetachedCall {
    async fn run(self) -> Result<Value, GatewayError> {
        let request = &self.request;
        let entry = AuditEntry::new(
            &self.request_id,
            &request.caller,
            &request.server_label,
            &request.tool_name,
            AuditResult::Success,
        )
        .with_tier(self.tier);
        let entry = if self.tier == TrustTier::Review {
            entry.with_details(json!({ "flagged_for_review": true }))
        } else {
            entry
        };

        let outcome = match self
            .forwarder
            .forward(
                &self.server,
                &request.tool_name,
                &request.arguments,
                self.deadline,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.breaker.release(self.token);
                error!("Cannot forward to server {}: {}", self.server.label, e);
                let mut entry = entry;
                entry.result = AuditResult::InternalError;
                self.audit.record(&entry);
                return Err(GatewayError::Internal);
            }
        };

        metrics::record_forward(&self.server.label, outcome.class.as_str(), outcome.latency);
        report_outcome(
            &self.breaker,
            &self.notifier,
            &self.server,
            self.token,
            outcome.class,
        );

        let entry = entry.with_outcome(outcome.class.as_str(), outcome.latency);
        match (outcome.class, outcome.payload) {
            (OutcomeClass::Success, Some(payload)) => {
                self.audit.record(&entry);
                Ok(payload)
            }
            (class, _) => {
                let mut entry = entry;
                entry.result = AuditResult::UpstreamError;
                self.audit.record(&entry);
                Err(GatewayError::Upstream {
                    timeout: class == OutcomeClass::Timeout,
                })
            }
        }
    }
}

/// `tools/list` for one server in the catalog aggregation.
struct DetachedListing {
    server: DownstreamServer,
    token: BreakerToken,
    deadline: Duration,
    forwarder: Arc<dyn Forwarder>,
    breaker: Arc<CircuitBreaker>,
    notifier: RegistryNotifier,
}

impl DetachedListing {
    async fn run(self) -> Vec<CatalogEntry> {
        let outcome = match self.forwarder.list_tools(&self.server, self.deadline).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.breaker.release(self.token);
                warn!("Cannot list tools of server {}: {}", self.server.label, e);
                return Vec::new();
            }
        };

        report_outcome(
            &self.breaker,
            &self.notifier,
            &self.server,
            self.token,
            outcome.class,
        );

        let Some(tools) = outcome.payload else {
            debug!(
                "Omitting server {} from catalog: {}",
                self.server.label,
                outcome.class.as_str()
            );
            return Vec::new();
        };
        tools
            .into_iter()
            .map(|tool| CatalogEntry {
                server: self.server.label.clone(),
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect()
    }
}
