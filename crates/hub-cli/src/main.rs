//! CLI entry point for the AI Hub identity subsystem.
//!
//! The `hub` binary works directly on a deployment's data and contents
//! directories: it resolves groups, administers OAuth clients, mints
//! static API keys and inspects tokens.

mod cli;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use hub_access::{ConfigCache, FileConfigCache, UserManager, UserStore};
use hub_auth::{AuthorizationServer, GrantType, NewClient, TokenService};
use hub_store::system_clock;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{AdminAction, Cli, ClientAction, Commands, GroupAction, TokenAction};
use crate::settings::{HubSettings, load_settings};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = load_settings(&cli.config);
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }
    if let Some(dir) = cli.contents_dir {
        settings.contents_dir = dir;
    }
    init_tracing(&settings.log_level);

    match cli.command {
        Commands::Groups { action } => cmd_groups(&settings, action).await,
        Commands::Clients { action } => cmd_clients(&settings, action).await,
        Commands::Token { action } => cmd_token(&settings, action).await,
        Commands::Admin { action } => cmd_admin(&settings, action).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: groups
// ---------------------------------------------------------------------------

async fn cmd_groups(settings: &HubSettings, action: GroupAction) -> Result<()> {
    let config = load_config(settings).await?;
    let resolver = config.resolver();

    match action {
        GroupAction::Resolve => {
            let snapshot = resolver.snapshot();
            let groups: Vec<_> = snapshot.iter().collect();
            print_json(&groups)?;
            info!(groups = groups.len(), "groups resolved");
        }
        GroupAction::UserPerms { groups } => {
            for id in &groups {
                if resolver.group(id).is_none() {
                    eprintln!("  warning: unknown group `{id}` skipped");
                }
            }
            print_json(&resolver.permissions_for_user(groups.as_slice()).await)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: clients
// ---------------------------------------------------------------------------

async fn cmd_clients(settings: &HubSettings, action: ClientAction) -> Result<()> {
    let server = open_server(settings).await?;
    let clients = server.clients();

    match action {
        ClientAction::List => {
            print_json(&clients.list_oauth_clients().await?)?;
        }
        ClientAction::Create {
            name,
            scopes,
            apps,
            models,
            grants,
            redirect_uris,
            public,
            expires_in,
            description,
        } => {
            let grant_types = grants
                .iter()
                .map(|g| g.parse::<GrantType>())
                .collect::<Result<Vec<_>, _>>()?;
            let new = NewClient {
                name,
                description,
                scopes,
                allowed_apps: apps,
                allowed_models: models,
                token_expiration_minutes: expires_in,
                redirect_uris,
                grant_types,
                client_type: if public {
                    hub_auth::ClientType::Public
                } else {
                    hub_auth::ClientType::Confidential
                },
            };
            let issued = clients.create_oauth_client(new, &operator()).await?;
            print_json(&issued)?;
            eprintln!("  The client secret is shown once. Store it now.");
        }
        ClientAction::Rotate { client_id } => {
            let Some(issued) = clients.rotate_client_secret(&client_id, &operator()).await? else {
                bail!("no client `{client_id}`");
            };
            print_json(&issued)?;
        }
        ClientAction::Delete { client_id } => {
            let deletion = server.delete_client(&client_id).await?;
            if !deletion.existed {
                bail!("no client `{client_id}`");
            }
            print_json(&deletion)?;
        }
        ClientAction::ApiKey { client_id, days } => {
            let client = clients
                .find_oauth_client(&client_id)
                .await?
                .filter(|c| c.active)
                .with_context(|| format!("no active client `{client_id}`"))?;
            let key = server.client_tokens().generate_static_api_key(&client, days)?;
            print_json(&serde_json::json!({
                "apiKey": key.access_token,
                "expiresIn": key.expires_in,
                "expiresAt": key.expires_at,
                "scopes": key.scopes,
            }))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: token
// ---------------------------------------------------------------------------

async fn cmd_token(settings: &HubSettings, action: TokenAction) -> Result<()> {
    match action {
        TokenAction::Introspect { token } => {
            let server = open_server(settings).await?;
            let introspection = server.introspect(&token);
            if introspection.active {
                return print_json(&introspection);
            }
            // Interactive session tokens are not OAuth tokens but are still
            // worth reporting on.
            match server.tokens().verify_jwt(&token) {
                Some(claims) => print_json(&serde_json::json!({
                    "active": true,
                    "session": claims,
                })),
                None => print_json(&introspection),
            }
        }
        TokenAction::Decode { token } => {
            let decoded = TokenService::decode_jwt(&token).context("not a decodable JWT")?;
            eprintln!("  Signature NOT verified.");
            print_json(&decoded)
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: admin
// ---------------------------------------------------------------------------

async fn cmd_admin(settings: &HubSettings, action: AdminAction) -> Result<()> {
    let config = load_config(settings).await?;
    let resolver = config.resolver();
    let shared: Arc<dyn ConfigCache> = config;
    let manager = UserManager::new(
        UserStore::new(settings.users_path(), system_clock()),
        resolver,
        shared,
    );
    let rescue = manager.rescue();

    match action {
        AdminAction::Status => {
            let admins = rescue.admin_users().await?;
            let reachable = rescue.has_any_admin().await?;
            println!();
            println!("  Administrators:   {}", admins.len());
            for admin in &admins {
                println!("    - {} ({})", admin.username, admin.id);
            }
            println!(
                "  Admin reachable:  {}",
                if reachable { "yes" } else { "NO (next login will be promoted)" }
            );
            println!();
        }
        AdminAction::CheckLast { user_id } => {
            let last = rescue.is_last_admin(&user_id).await?;
            print_json(&serde_json::json!({ "userId": user_id, "isLastAdmin": last }))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn load_config(settings: &HubSettings) -> Result<Arc<FileConfigCache>> {
    let config = FileConfigCache::load(&settings.contents_dir)
        .await
        .with_context(|| {
            format!("failed to load configuration from {}", settings.contents_dir.display())
        })?;
    Ok(Arc::new(config))
}

async fn open_server(settings: &HubSettings) -> Result<AuthorizationServer> {
    let config = load_config(settings).await?;
    let platform = config.platform();
    AuthorizationServer::open(&settings.data_dir, &platform, system_clock())
        .await
        .with_context(|| format!("failed to open data directory {}", settings.data_dir.display()))
}

/// Recorded as `createdBy` / `lastRotatedBy`.
fn operator() -> String {
    std::env::var("USER")
        .map(|u| format!("cli:{u}"))
        .unwrap_or_else(|_| "cli".into())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
