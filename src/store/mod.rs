//! Collaborator stores consumed by the gateway.
//!
//! The gateway only reads servers, trust rules and callers, and appends audit
//! entries. Administrative writes live on the concrete store types.

mod memory_store;
mod models;
mod schema;
mod sqlite_gateway_store;

pub use memory_store::MemoryGatewayStore;
pub use models::*;
pub use schema::GATEWAY_VERSIONED_SCHEMAS;
pub use sqlite_gateway_store::SqliteGatewayStore;

use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub trait ServerStore: Send + Sync {
    fn get_by_label(&self, label: &str) -> Result<Option<DownstreamServer>>;
    fn list(&self) -> Result<Vec<DownstreamServer>>;
}

pub trait TrustRuleStore: Send + Sync {
    fn rules_for_workspace(&self, workspace_id: &str) -> Result<Vec<TrustRule>>;
}

pub trait TrustDefaultStore: Send + Sync {
    fn default_tier(&self) -> Result<TrustTier>;
}

/// Append-only audit trail. Callers treat failures as non-fatal.
pub trait AuditSink: Send + Sync {
    fn insert(&self, entry: &AuditEntry) -> Result<()>;
}

pub trait CallerStore: Send + Sync {
    fn caller_for_api_key(&self, api_key: &str) -> Result<Option<Caller>>;
}

/// Everything the running server needs from a single backing store.
pub trait GatewayStore:
    ServerStore + TrustRuleStore + TrustDefaultStore + AuditSink + CallerStore
{
}

impl<T> GatewayStore for T where
    T: ServerStore + TrustRuleStore + TrustDefaultStore + AuditSink + CallerStore
{
}

/// Only the SHA-256 of an API key is ever persisted.
pub fn hash_api_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generates a fresh caller API key with a recognizable prefix.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("tg_{}", URL_SAFE_NO_PAD.encode(bytes))
}
