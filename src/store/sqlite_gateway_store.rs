use super::models::{
    AuditEntry, AuditResult, AuthType, BreakerSettings, Caller, CallerRole, DownstreamServer,
    TrustRule, TrustTier,
};
use super::schema::GATEWAY_VERSIONED_SCHEMAS;
use super::{
    generate_api_key, hash_api_key, AuditSink, CallerStore, ServerStore, TrustDefaultStore,
    TrustRuleStore,
};
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const GLOBAL_SCOPE: &str = "global";

/// Tier used when no global default has been configured.
pub const FALLBACK_DEFAULT_TIER: TrustTier = TrustTier::Review;

const SERVER_COLUMNS: &str = "label, endpoint_url, auth_type, auth_header, encrypted_credential, \
     enabled, failure_threshold, open_duration_ms";

pub struct SqliteGatewayStore {
    conn: Arc<Mutex<Connection>>,
}

struct ServerRow {
    label: String,
    endpoint_url: String,
    auth_type: String,
    auth_header: Option<String>,
    encrypted_credential: Option<String>,
    enabled: bool,
    failure_threshold: i64,
    open_duration_ms: i64,
}

impl ServerRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            label: row.get("label")?,
            endpoint_url: row.get("endpoint_url")?,
            auth_type: row.get("auth_type")?,
            auth_header: row.get("auth_header")?,
            encrypted_credential: row.get("encrypted_credential")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            failure_threshold: row.get("failure_threshold")?,
            open_duration_ms: row.get("open_duration_ms")?,
        })
    }

    fn into_server(self) -> Result<DownstreamServer> {
        let auth = AuthType::from_parts(&self.auth_type, self.auth_header).with_context(|| {
            format!(
                "Server {} has unknown auth type '{}'",
                self.label, self.auth_type
            )
        })?;
        Ok(DownstreamServer {
            label: self.label,
            endpoint_url: self.endpoint_url,
            auth,
            encrypted_credential: self.encrypted_credential,
            enabled: self.enabled,
            breaker: BreakerSettings {
                failure_threshold: self.failure_threshold.max(1) as u32,
                open_duration: Duration::from_millis(self.open_duration_ms.max(0) as u64),
            },
        })
    }
}

impl SqliteGatewayStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open gateway database")?;
        if is_new_db {
            info!("Creating new gateway database at {:?}", path);
        }
        open_versioned(&mut conn, GATEWAY_VERSIONED_SCHEMAS, is_new_db, "gateway")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh, non-persistent store. Handy for tests and throwaway runs.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        open_versioned(&mut conn, GATEWAY_VERSIONED_SCHEMAS, true, "gateway")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Gateway database lock poisoned"))
    }

    // -------------------------------------------------------------------------
    // Administration
    // -------------------------------------------------------------------------

    pub fn upsert_server(&self, server: &DownstreamServer) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO servers (label, endpoint_url, auth_type, auth_header, encrypted_credential, \
                 enabled, failure_threshold, open_duration_ms, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(label) DO UPDATE SET \
                 endpoint_url = excluded.endpoint_url, \
                 auth_type = excluded.auth_type, \
                 auth_header = excluded.auth_header, \
                 encrypted_credential = excluded.encrypted_credential, \
                 enabled = excluded.enabled, \
                 failure_threshold = excluded.failure_threshold, \
                 open_duration_ms = excluded.open_duration_ms, \
                 updated_at = excluded.updated_at",
            params![
                server.label,
                server.endpoint_url,
                server.auth.kind(),
                server.auth.header_name(),
                server.encrypted_credential,
                server.enabled as i64,
                server.breaker.failure_threshold as i64,
                server.breaker.open_duration.as_millis() as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to save server {}", server.label))?;
        debug!("Saved server {}", server.label);
        Ok(())
    }

    /// Returns false when no server has the given label.
    pub fn set_server_enabled(&self, label: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE servers SET enabled = ?1, updated_at = ?2 WHERE label = ?3",
            params![enabled as i64, Utc::now().to_rfc3339(), label],
        )?;
        Ok(updated > 0)
    }

    pub fn upsert_trust_rule(&self, rule: &TrustRule) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trust_rules (workspace_id, pattern, tier) VALUES (?1, ?2, ?3) \
             ON CONFLICT(workspace_id, pattern) DO UPDATE SET tier = excluded.tier",
            params![rule.workspace_id, rule.pattern, rule.tier.as_str()],
        )?;
        Ok(())
    }

    pub fn remove_trust_rule(&self, workspace_id: &str, pattern: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM trust_rules WHERE workspace_id = ?1 AND pattern = ?2",
            params![workspace_id, pattern],
        )?;
        Ok(removed > 0)
    }

    pub fn set_default_tier(&self, tier: TrustTier) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trust_defaults (scope, tier) VALUES (?1, ?2) \
             ON CONFLICT(scope) DO UPDATE SET tier = excluded.tier",
            params![GLOBAL_SCOPE, tier.as_str()],
        )?;
        Ok(())
    }

    /// Creates a new API key for the caller and returns it. The plaintext key
    /// is not recoverable afterwards.
    pub fn create_api_key(
        &self,
        caller_id: &str,
        role: CallerRole,
        workspace_id: &str,
    ) -> Result<String> {
        let api_key = generate_api_key();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO api_keys (key_hash, caller_id, role, workspace_id) VALUES (?1, ?2, ?3, ?4)",
            params![hash_api_key(&api_key), caller_id, role.as_str(), workspace_id],
        )?;
        info!("Created API key for caller {} ({})", caller_id, role.as_str());
        Ok(api_key)
    }

    /// Revokes every key of the caller, returning how many were active.
    pub fn revoke_caller_keys(&self, caller_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "UPDATE api_keys SET revoked = 1 WHERE caller_id = ?1 AND revoked = 0",
            params![caller_id],
        )?)
    }

    pub fn recent_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, timestamp, caller_id, workspace_id, server_label, tool_name, \
                 result, tier, outcome, latency_ms, details \
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let timestamp: String = row.get("timestamp")?;
            let result: String = row.get("result")?;
            let tier: Option<String> = row.get("tier")?;
            let details: Option<String> = row.get("details")?;
            Ok(AuditEntry {
                request_id: row.get("request_id")?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                caller_id: row.get("caller_id")?,
                workspace_id: row.get("workspace_id")?,
                server_label: row.get("server_label")?,
                tool_name: row.get("tool_name")?,
                result: AuditResult::parse(&result).unwrap_or(AuditResult::InternalError),
                tier: tier.as_deref().and_then(TrustTier::parse),
                outcome: row.get("outcome")?,
                latency_ms: row.get("latency_ms")?,
                details: details.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl ServerStore for SqliteGatewayStore {
    fn get_by_label(&self, label: &str) -> Result<Option<DownstreamServer>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM servers WHERE label = ?1", SERVER_COLUMNS),
                params![label],
                ServerRow::from_row,
            )
            .optional()?;
        row.map(ServerRow::into_server).transpose()
    }

    fn list(&self) -> Result<Vec<DownstreamServer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM servers ORDER BY label",
            SERVER_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], ServerRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ServerRow::into_server).collect()
    }
}

impl TrustRuleStore for SqliteGatewayStore {
    fn rules_for_workspace(&self, workspace_id: &str) -> Result<Vec<TrustRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT workspace_id, pattern, tier FROM trust_rules WHERE workspace_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![workspace_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(workspace_id, pattern, tier)| {
                let tier = TrustTier::parse(&tier).with_context(|| {
                    format!("Trust rule '{}' has unknown tier '{}'", pattern, tier)
                })?;
                Ok(TrustRule {
                    workspace_id,
                    pattern,
                    tier,
                })
            })
            .collect()
    }
}

impl TrustDefaultStore for SqliteGatewayStore {
    fn default_tier(&self) -> Result<TrustTier> {
        let conn = self.conn()?;
        let tier: Option<String> = conn
            .query_row(
                "SELECT tier FROM trust_defaults WHERE scope = ?1",
                params![GLOBAL_SCOPE],
                |row| row.get(0),
            )
            .optional()?;
        match tier {
            None => Ok(FALLBACK_DEFAULT_TIER),
            Some(tier) => TrustTier::parse(&tier)
                .with_context(|| format!("Default trust tier '{}' is unknown", tier)),
        }
    }
}

impl AuditSink for SqliteGatewayStore {
    fn insert(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (request_id, timestamp, caller_id, workspace_id, server_label, \
                 tool_name, result, tier, outcome, latency_ms, details) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.request_id,
                entry.timestamp.to_rfc3339(),
                entry.caller_id,
                entry.workspace_id,
                entry.server_label,
                entry.tool_name,
                entry.result.as_str(),
                entry.tier.map(|t| t.as_str()),
                entry.outcome,
                entry.latency_ms,
                entry.details.as_ref().map(|d| d.to_string()),
            ],
        )?;
        Ok(())
    }
}

impl CallerStore for SqliteGatewayStore {
    fn caller_for_api_key(&self, api_key: &str) -> Result<Option<Caller>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT caller_id, role, workspace_id FROM api_keys \
                 WHERE key_hash = ?1 AND revoked = 0",
                params![hash_api_key(api_key)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, role, workspace_id)| {
            let role = CallerRole::parse(&role)
                .with_context(|| format!("Caller {} has unknown role '{}'", id, role))?;
            Ok(Caller {
                id,
                role,
                workspace_id,
            })
        })
        .transpose()
    }
}
