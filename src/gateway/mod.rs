//! The tool-call gateway: admission control, policy and forwarding for calls
//! to downstream MCP servers.

mod audit;
mod circuit_breaker;
mod crypto;
mod error;
mod forwarder;
mod notifier;
mod orchestrator;
mod protocol;
mod rate_limit;
mod trust;

pub use audit::AuditLogger;
pub use circuit_breaker::{
    Admission, BreakerToken, CircuitBreaker, CircuitSnapshot, CircuitState, Transition,
};
pub use crypto::{Credential, CredentialCipher, CredentialError};
pub use error::{retry_after_secs, GatewayError};
pub use forwarder::{
    ForwardError, Forwarder, HttpForwarder, Outcome, OutcomeClass, DEFAULT_MAX_RESPONSE_BYTES,
};
pub use notifier::{
    LogSubscriber, RegistryChange, RegistryChangeKind, RegistryChangeSubscriber,
    RegistryNotifier, WebhookSubscriber, DEFAULT_QUEUE_CAPACITY,
};
pub use orchestrator::{
    CatalogEntry, Gateway, GatewaySettings, InvocationRequest, RateLimitKey,
    UNRESOLVED_SERVER_LABEL,
};
pub use protocol::{ToolDefinition, ToolsListResult};
pub use rate_limit::RateLimiter;
pub use trust::{
    ClassificationError, MostSpecificMatch, RuleMatch, RulePrecedence, ToolPattern,
    TrustClassifier,
};
