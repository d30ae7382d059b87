//! In-memory implementation of every gateway store.
//!
//! Backs tests and ephemeral runs. Reads can be made to fail on demand so
//! callers can exercise their store-outage paths.

use super::models::{AuditEntry, Caller, DownstreamServer, TrustRule, TrustTier};
use super::sqlite_gateway_store::FALLBACK_DEFAULT_TIER;
use super::{hash_api_key, AuditSink, CallerStore, ServerStore, TrustDefaultStore, TrustRuleStore};
use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    servers: BTreeMap<String, DownstreamServer>,
    rules: Vec<TrustRule>,
    default_tier: Option<TrustTier>,
    callers: HashMap<String, Caller>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryGatewayStore {
    inner: Mutex<Inner>,
    fail_trust_reads: AtomicBool,
    fail_audit_writes: AtomicBool,
}

impl MemoryGatewayStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("Memory store lock poisoned"))
    }

    pub fn with_server(self, server: DownstreamServer) -> Self {
        self.upsert_server(server);
        self
    }

    pub fn with_rule(self, rule: TrustRule) -> Self {
        self.add_rule(rule);
        self
    }

    pub fn with_default_tier(self, tier: TrustTier) -> Self {
        if let Ok(mut inner) = self.inner() {
            inner.default_tier = Some(tier);
        }
        self
    }

    /// Registers `caller` under the given plaintext API key.
    pub fn with_caller(self, api_key: &str, caller: Caller) -> Self {
        if let Ok(mut inner) = self.inner() {
            inner.callers.insert(hash_api_key(api_key), caller);
        }
        self
    }

    pub fn upsert_server(&self, server: DownstreamServer) {
        if let Ok(mut inner) = self.inner() {
            inner.servers.insert(server.label.clone(), server);
        }
    }

    pub fn add_rule(&self, rule: TrustRule) {
        if let Ok(mut inner) = self.inner() {
            inner
                .rules
                .retain(|r| !(r.workspace_id == rule.workspace_id && r.pattern == rule.pattern));
            inner.rules.push(rule);
        }
    }

    /// Makes trust rule and default lookups fail until reset.
    pub fn set_trust_reads_failing(&self, failing: bool) {
        self.fail_trust_reads.store(failing, Ordering::SeqCst);
    }

    pub fn set_audit_writes_failing(&self, failing: bool) {
        self.fail_audit_writes.store(failing, Ordering::SeqCst);
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner().map(|i| i.audit.clone()).unwrap_or_default()
    }
}

impl ServerStore for MemoryGatewayStore {
    fn get_by_label(&self, label: &str) -> Result<Option<DownstreamServer>> {
        Ok(self.inner()?.servers.get(label).cloned())
    }

    fn list(&self) -> Result<Vec<DownstreamServer>> {
        Ok(self.inner()?.servers.values().cloned().collect())
    }
}

impl TrustRuleStore for MemoryGatewayStore {
    fn rules_for_workspace(&self, workspace_id: &str) -> Result<Vec<TrustRule>> {
        if self.fail_trust_reads.load(Ordering::SeqCst) {
            bail!("trust rule store unavailable");
        }
        Ok(self
            .inner()?
            .rules
            .iter()
            .filter(|r| r.workspace_id == workspace_id)
            .cloned()
            .collect())
    }
}

impl TrustDefaultStore for MemoryGatewayStore {
    fn default_tier(&self) -> Result<TrustTier> {
        if self.fail_trust_reads.load(Ordering::SeqCst) {
            bail!("trust default store unavailable");
        }
        Ok(self.inner()?.default_tier.unwrap_or(FALLBACK_DEFAULT_TIER))
    }
}

impl AuditSink for MemoryGatewayStore {
    fn insert(&self, entry: &AuditEntry) -> Result<()> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            bail!("audit sink unavailable");
        }
        self.inner()?.audit.push(entry.clone());
        Ok(())
    }
}

impl CallerStore for MemoryGatewayStore {
    fn caller_for_api_key(&self, api_key: &str) -> Result<Option<Caller>> {
        Ok(self.inner()?.callers.get(&hash_api_key(api_key)).cloned())
    }
}
