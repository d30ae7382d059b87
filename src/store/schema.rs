//! SQLite schema definitions for the gateway database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

// =============================================================================
// Version 1
// =============================================================================

/// Registered downstream tool servers.
const SERVERS_TABLE_V1: Table = Table {
    name: "servers",
    columns: &[
        sqlite_column!("label", &SqlType::Text, is_primary_key = true),
        sqlite_column!("endpoint_url", &SqlType::Text, non_null = true),
        sqlite_column!("auth_type", &SqlType::Text, non_null = true),
        sqlite_column!("auth_header", &SqlType::Text),
        sqlite_column!("encrypted_credential", &SqlType::Text),
        sqlite_column!(
            "enabled",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("failure_threshold", &SqlType::Integer, non_null = true),
        sqlite_column!("open_duration_ms", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// Per-workspace glob rules mapping tool names to a trust tier.
const TRUST_RULES_TABLE_V1: Table = Table {
    name: "trust_rules",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("workspace_id", &SqlType::Text, non_null = true),
        sqlite_column!("pattern", &SqlType::Text, non_null = true),
        sqlite_column!("tier", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_trust_rules_workspace", "workspace_id")],
    unique_constraints: &[&["workspace_id", "pattern"]],
};

/// Fallback tiers. Only the `global` scope is read today.
const TRUST_DEFAULTS_TABLE_V1: Table = Table {
    name: "trust_defaults",
    columns: &[
        sqlite_column!("scope", &SqlType::Text, is_primary_key = true),
        sqlite_column!("tier", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const API_KEYS_TABLE_V1: Table = Table {
    name: "api_keys",
    columns: &[
        sqlite_column!("key_hash", &SqlType::Text, is_primary_key = true),
        sqlite_column!("caller_id", &SqlType::Text, non_null = true),
        sqlite_column!("role", &SqlType::Text, non_null = true),
        sqlite_column!("workspace_id", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!(
            "revoked",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_api_keys_caller", "caller_id")],
    unique_constraints: &[],
};

const AUDIT_LOG_TABLE_V1: Table = Table {
    name: "audit_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("request_id", &SqlType::Text, non_null = true),
        sqlite_column!("timestamp", &SqlType::Text, non_null = true),
        sqlite_column!("caller_id", &SqlType::Text, non_null = true),
        sqlite_column!("workspace_id", &SqlType::Text, non_null = true),
        sqlite_column!("server_label", &SqlType::Text, non_null = true),
        sqlite_column!("tool_name", &SqlType::Text, non_null = true),
        sqlite_column!("result", &SqlType::Text, non_null = true),
        sqlite_column!("tier", &SqlType::Text),
        sqlite_column!("outcome", &SqlType::Text),
        sqlite_column!("latency_ms", &SqlType::Integer),
        sqlite_column!("details", &SqlType::Text),
    ],
    indices: &[
        ("idx_audit_log_timestamp", "timestamp DESC"),
        ("idx_audit_log_server", "server_label"),
    ],
    unique_constraints: &[],
};

pub const GATEWAY_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        SERVERS_TABLE_V1,
        TRUST_RULES_TABLE_V1,
        TRUST_DEFAULTS_TABLE_V1,
        API_KEYS_TABLE_V1,
        AUDIT_LOG_TABLE_V1,
    ],
    migration: None,
}];
