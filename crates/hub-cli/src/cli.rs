//! CLI argument definitions for the `hub` binary.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hub_access::{MAX_TOKEN_LIFETIME_MINUTES, MAX_TTL_DAYS};

/// AI Hub identity and access administration.
#[derive(Parser)]
#[command(
    name = "hub",
    version,
    about = "AI Hub identity and access administration",
    long_about = "Inspect group permissions, manage OAuth clients, mint static API keys \
                  and check tokens against the data directory of an AI Hub deployment."
)]
pub struct Cli {
    /// Path to the TOML settings file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    pub config: PathBuf,

    /// Override `[hub] data_dir`.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override `[hub] contents_dir`.
    #[arg(long, global = true)]
    pub contents_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect the group configuration.
    Groups {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Manage registered OAuth clients.
    Clients {
        #[command(subcommand)]
        action: ClientAction,
    },

    /// Inspect issued tokens.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Administrator bootstrap checks.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
pub enum GroupAction {
    /// Print every group with its inheritance-flattened permissions.
    Resolve,
    /// Print the merged permissions for a set of group ids.
    UserPerms {
        /// Group ids, e.g. `users admins`.
        #[arg(required = true)]
        groups: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum ClientAction {
    /// List registered clients (secret hashes redacted).
    List,
    /// Register a client and print its secret once.
    Create {
        /// Display name.
        name: String,
        /// Scopes the client may request.
        #[arg(long, short, value_delimiter = ',')]
        scopes: Vec<String>,
        /// App ids the client may call. Empty means unrestricted.
        #[arg(long, value_delimiter = ',')]
        apps: Vec<String>,
        /// Model ids the client may call. Empty means unrestricted.
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
        /// Grant types, e.g. `authorization_code,refresh_token`.
        #[arg(long, value_delimiter = ',')]
        grants: Vec<String>,
        /// Registered redirect URIs.
        #[arg(long = "redirect-uri")]
        redirect_uris: Vec<String>,
        /// Register as a public client (no secret authentication).
        #[arg(long)]
        public: bool,
        /// Access token lifetime in minutes.
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_TOKEN_LIFETIME_MINUTES))]
        expires_in: Option<i64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Issue a new secret, invalidating the old one.
    Rotate { client_id: String },
    /// Delete a client and revoke its refresh tokens and consents.
    Delete { client_id: String },
    /// Mint a long-lived static API key for a client.
    ApiKey {
        client_id: String,
        /// Lifetime in days.
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_TTL_DAYS))]
        days: Option<i64>,
    },
}

#[derive(Subcommand)]
pub enum TokenAction {
    /// Verify a token and print its RFC 7662 introspection.
    Introspect { token: String },
    /// Decode a token without verifying it.
    Decode { token: String },
}

#[derive(Subcommand)]
pub enum AdminAction {
    /// Report whether an administrator exists or can log in.
    Status,
    /// Report whether a user is the only administrator.
    CheckLast { user_id: String },
}
