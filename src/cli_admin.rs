use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use toolgate_server::config::DEFAULT_ENCRYPTION_KEY_ENV;
use toolgate_server::gateway::{CredentialCipher, ToolPattern};
use toolgate_server::store::{
    AuthType, BreakerSettings, CallerRole, DownstreamServer, ServerStore, SqliteGatewayStore,
    TrustRule, TrustTier,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_tier(s: &str) -> Result<TrustTier, String> {
    TrustTier::parse(s).ok_or_else(|| format!("unknown tier '{}', expected auto|review|block", s))
}

fn parse_role(s: &str) -> Result<CallerRole, String> {
    CallerRole::parse(s).ok_or_else(|| format!("unknown role '{}', expected admin|agent|observer", s))
}

#[derive(Parser, Debug)]
#[command(name = "toolgate-admin", about = "Manages the toolgate registry database")]
struct CliArgs {
    /// Path to the gateway SQLite database, created if missing.
    #[clap(long, value_parser = parse_path)]
    pub db: PathBuf,

    /// Environment variable holding the base64 credential encryption key.
    #[clap(long, default_value = DEFAULT_ENCRYPTION_KEY_ENV)]
    pub encryption_key_env: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints a fresh base64 encryption key.
    GenerateKey,

    /// Registers a downstream server, or replaces the one with the same label.
    /// The credential is read from the environment variable named by
    /// --credential-env and stored encrypted.
    AddServer {
        label: String,
        endpoint_url: String,
        /// One of none, api_key, bearer_token.
        #[clap(long, default_value = "none")]
        auth: String,
        /// Header carrying the key for api_key servers.
        #[clap(long)]
        header: Option<String>,
        #[clap(long)]
        credential_env: Option<String>,
        #[clap(long, default_value_t = 5)]
        failure_threshold: u32,
        #[clap(long, default_value_t = 30)]
        open_duration_sec: u64,
        /// Register the server disabled.
        #[clap(long)]
        disabled: bool,
    },

    EnableServer { label: String },

    DisableServer { label: String },

    /// Lists registered servers. Credentials are never shown.
    ListServers,

    /// Adds or replaces a trust rule for a workspace.
    AddRule {
        workspace_id: String,
        pattern: String,
        #[clap(value_parser = parse_tier)]
        tier: TrustTier,
    },

    RemoveRule { workspace_id: String, pattern: String },

    /// Sets the tier used when no rule matches.
    SetDefaultTier {
        #[clap(value_parser = parse_tier)]
        tier: TrustTier,
    },

    /// Creates an API key for a caller. The key is printed once.
    CreateApiKey {
        caller_id: String,
        #[clap(value_parser = parse_role)]
        role: CallerRole,
        workspace_id: String,
    },

    /// Revokes every API key of a caller.
    RevokeCaller { caller_id: String },

    /// Shows the most recent audit entries.
    Audit {
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
}

#[allow(clippy::too_many_arguments)]
fn build_server(
    cli: &CliArgs,
    label: String,
    endpoint_url: String,
    auth: &str,
    header: Option<String>,
    credential_env: Option<&str>,
    breaker: BreakerSettings,
    enabled: bool,
) -> Result<DownstreamServer> {
    let auth = AuthType::from_parts(auth, header)
        .with_context(|| format!("Unknown auth type '{}'", auth))?;
    reqwest::Url::parse(&endpoint_url)
        .with_context(|| format!("Invalid endpoint URL '{}'", endpoint_url))?;

    let encrypted_credential = match (auth.requires_credential(), credential_env) {
        (false, None) => None,
        (false, Some(_)) => bail!("Auth type {} takes no credential", auth.kind()),
        (true, None) => bail!("Auth type {} needs --credential-env", auth.kind()),
        (true, Some(var)) => {
            let credential = std::env::var(var)
                .with_context(|| format!("Credential variable {} is not set", var))?;
            let cipher = CredentialCipher::from_env(&cli.encryption_key_env)?;
            Some(cipher.encrypt(&credential)?)
        }
    };

    Ok(DownstreamServer {
        label,
        endpoint_url,
        auth,
        encrypted_credential,
        enabled,
        breaker,
    })
}

fn open_store(cli: &CliArgs) -> Result<SqliteGatewayStore> {
    SqliteGatewayStore::new(&cli.db)
        .with_context(|| format!("Failed to open gateway database at {:?}", cli.db))
}

fn run(cli: &CliArgs) -> Result<()> {
    match &cli.command {
        Command::GenerateKey => {
            println!("{}", CredentialCipher::generate_key());
        }
        Command::AddServer {
            label,
            endpoint_url,
            auth,
            header,
            credential_env,
            failure_threshold,
            open_duration_sec,
            disabled,
        } => {
            if *failure_threshold == 0 || *open_duration_sec == 0 {
                bail!("failure threshold and open duration must be greater than zero");
            }
            let server = build_server(
                cli,
                label.clone(),
                endpoint_url.clone(),
                auth,
                header.clone(),
                credential_env.as_deref(),
                BreakerSettings {
                    failure_threshold: *failure_threshold,
                    open_duration: Duration::from_secs(*open_duration_sec),
                },
                !disabled,
            )?;
            open_store(cli)?.upsert_server(&server)?;
            println!("Registered server {}", server.label);
        }
        Command::EnableServer { label } | Command::DisableServer { label } => {
            let enabled = matches!(cli.command, Command::EnableServer { .. });
            if !open_store(cli)?.set_server_enabled(label, enabled)? {
                bail!("No server labelled {}", label);
            }
            println!(
                "Server {} {}",
                label,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Command::ListServers => {
            for server in open_store(cli)?.list()? {
                println!(
                    "{:<20} {:<8} {:<13} threshold={} open={}s  {}",
                    server.label,
                    if server.enabled { "enabled" } else { "disabled" },
                    server.auth.kind(),
                    server.breaker.failure_threshold,
                    server.breaker.open_duration.as_secs(),
                    server.endpoint_url,
                );
            }
        }
        Command::AddRule {
            workspace_id,
            pattern,
            tier,
        } => {
            ToolPattern::compile(pattern)
                .with_context(|| format!("Invalid tool pattern '{}'", pattern))?;
            open_store(cli)?.upsert_trust_rule(&TrustRule::new(
                workspace_id.as_str(),
                pattern.as_str(),
                *tier,
            ))?;
            println!("{} {} -> {}", workspace_id, pattern, tier);
        }
        Command::RemoveRule {
            workspace_id,
            pattern,
        } => {
            if !open_store(cli)?.remove_trust_rule(workspace_id, pattern)? {
                bail!("No rule {} in workspace {}", pattern, workspace_id);
            }
            println!("Removed rule {} from {}", pattern, workspace_id);
        }
        Command::SetDefaultTier { tier } => {
            open_store(cli)?.set_default_tier(*tier)?;
            println!("Default tier is now {}", tier);
        }
        Command::CreateApiKey {
            caller_id,
            role,
            workspace_id,
        } => {
            let key = open_store(cli)?.create_api_key(caller_id, *role, workspace_id)?;
            println!("{}", key);
            eprintln!("Store this key now, it cannot be shown again.");
        }
        Command::RevokeCaller { caller_id } => {
            let revoked = open_store(cli)?.revoke_caller_keys(caller_id)?;
            println!("Revoked {} key(s) of {}", revoked, caller_id);
        }
        Command::Audit { limit } => {
            for entry in open_store(cli)?.recent_audit_entries(*limit)? {
                println!(
                    "{} {} {:<10} {}/{} {} tier={} outcome={} latency={}ms",
                    entry.timestamp.to_rfc3339(),
                    entry.request_id,
                    entry.caller_id,
                    entry.server_label,
                    entry.tool_name,
                    entry.result.as_str(),
                    entry.tier.map(|t| t.as_str()).unwrap_or("-"),
                    entry.outcome.as_deref().unwrap_or("-"),
                    entry
                        .latency_ms
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = CliArgs::parse();
    run(&cli)
}
