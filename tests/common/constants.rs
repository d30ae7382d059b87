//! Shared constants for end-to-end tests
//!
//! When fixture data changes (server labels, workspaces, tool names),
//! update only this file.

// ============================================================================
// Callers
// ============================================================================

/// Agent caller, workspace with restrictive rules
pub const AGENT_ID: &str = "agent-1";

/// Observer caller, may only browse the catalog
pub const OBSERVER_ID: &str = "observer-1";

/// Admin caller living in a workspace without block rules
pub const ADMIN_ID: &str = "admin-1";

pub const RESTRICTED_WORKSPACE: &str = "w-restricted";
pub const OPEN_WORKSPACE: &str = "w-open";

// ============================================================================
// Downstream servers
// ============================================================================

/// Healthy MCP server requiring a bearer token
pub const TOOLS_SERVER: &str = "tools";

/// Server whose endpoint always answers 500
pub const FLAKY_SERVER: &str = "flaky";

/// Registered but disabled server
pub const DISABLED_SERVER: &str = "offline";

/// Failures after which the flaky server's circuit opens
pub const FLAKY_FAILURE_THRESHOLD: u32 = 2;

/// Credential the gateway must present to the tools server
pub const DOWNSTREAM_TOKEN: &str = "downstream-secret-token";

// ============================================================================
// Tools
// ============================================================================

pub const ECHO_TOOL: &str = "echo";
pub const SLOW_TOOL: &str = "slow";
pub const DANGER_TOOL: &str = "danger_delete";
pub const REJECTED_TOOL: &str = "bad_params";

// ============================================================================
// Timeouts
// ============================================================================

/// Gateway deadline for downstream calls
pub const CALL_TIMEOUT_MS: u64 = 500;

/// How long the slow tool takes, well past the call deadline
pub const SLOW_TOOL_DELAY_MS: u64 = 2_000;

pub const SERVER_READY_TIMEOUT_MS: u64 = 5_000;
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;
pub const REQUEST_TIMEOUT_SECS: u64 = 10;
