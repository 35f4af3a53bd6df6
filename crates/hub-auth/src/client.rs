//! OAuth client registry (`oauth-clients.json`).
//!
//! Secrets are generated here, handed back in plaintext exactly once (on
//! creation and on rotation), and persisted only as bcrypt hashes. Every
//! read path that leaves this module returns a redacted record.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use hub_store::{Change, JsonFile, SharedClock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::crypto::{TOKEN_BYTES, bcrypt_hash, bcrypt_verify, random_hex};
use crate::error::{AuthError, Result};
use crate::lifetime;

/// Minimum spacing between two `lastUsed` writes for one client.
pub const LAST_USED_THROTTLE_SECS: i64 = 60;

/// Default lifetime of tokens issued to a client.
pub const DEFAULT_TOKEN_EXPIRATION_MINUTES: i64 = 60;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// OAuth 2.0 grant types a client may be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    ClientCredentials,
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientCredentials => "client_credentials",
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GrantType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client_credentials" => Ok(Self::ClientCredentials),
            "authorization_code" => Ok(Self::AuthorizationCode),
            "refresh_token" => Ok(Self::RefreshToken),
            other => Err(AuthError::request(format!("unsupported grant type `{other}`"))),
        }
    }
}

/// RFC 6749 section 2.1 client types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Confidential,
    Public,
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::ClientCredentials]
}

fn default_true() -> bool {
    true
}

/// A registered client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthClient {
    pub client_id: String,
    /// bcrypt hash of the secret; empty in redacted copies.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Empty means every app.
    #[serde(default)]
    pub allowed_apps: Vec<String>,
    /// Empty means every model.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    pub token_expiration_minutes: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,
    #[serde(default)]
    pub client_type: ClientType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated_by: Option<String>,
}

impl OAuthClient {
    /// Copy without the secret hash.
    pub fn redacted(&self) -> Self {
        Self {
            client_secret: String::new(),
            ..self.clone()
        }
    }

    pub fn is_public(&self) -> bool {
        self.client_type == ClientType::Public
    }

    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    /// Exact string match against the registered URIs.
    pub fn allows_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == uri)
    }
}

/// On-disk document.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClientsDocument {
    #[serde(default)]
    pub clients: BTreeMap<String, OAuthClient>,
}

/// Registration request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewClient {
    pub name: String,
    pub description: Option<String>,
    pub scopes: Vec<String>,
    pub allowed_apps: Vec<String>,
    pub allowed_models: Vec<String>,
    pub token_expiration_minutes: Option<i64>,
    pub redirect_uris: Vec<String>,
    /// Defaults to `client_credentials` when empty.
    pub grant_types: Vec<GrantType>,
    pub client_type: ClientType,
}

/// Fields an update may touch. Identifiers and the secret are not among
/// them, and unknown fields are rejected when parsing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub allowed_apps: Option<Vec<String>>,
    pub allowed_models: Option<Vec<String>>,
    pub token_expiration_minutes: Option<i64>,
    pub active: Option<bool>,
    pub redirect_uris: Option<Vec<String>>,
    pub grant_types: Option<Vec<GrantType>>,
}

/// A client together with its plaintext secret. Only produced by
/// creation and rotation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedClientSecret {
    pub client: OAuthClient,
    pub client_secret: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_redirect_uris(uris: &[String]) -> Result<()> {
    for uri in uris {
        let parsed =
            Url::parse(uri).map_err(|e| AuthError::request(format!("redirect uri `{uri}`: {e}")))?;
        if parsed.fragment().is_some() {
            return Err(AuthError::request(format!(
                "redirect uri `{uri}` must not contain a fragment"
            )));
        }
    }
    Ok(())
}

fn validate_shape(client: &OAuthClient) -> Result<()> {
    if client.name.trim().is_empty() {
        return Err(AuthError::request("client name is required"));
    }
    lifetime::token_minutes(client.token_expiration_minutes)?;
    if client.grant_types.is_empty() {
        return Err(AuthError::request("at least one grant type is required"));
    }
    validate_redirect_uris(&client.redirect_uris)?;
    if client.allows_grant(GrantType::AuthorizationCode) && client.redirect_uris.is_empty() {
        return Err(AuthError::request(
            "authorization_code clients need a redirect uri",
        ));
    }
    if client.is_public() && client.allows_grant(GrantType::ClientCredentials) {
        return Err(AuthError::UnauthorizedClient {
            reason: "public clients cannot use client_credentials".into(),
        });
    }
    Ok(())
}

/// Whether a successful authentication at `now` should refresh `lastUsed`.
pub(crate) fn should_touch(last_used: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_used.is_none_or(|at| now - at >= Duration::seconds(LAST_USED_THROTTLE_SECS))
}

// ---------------------------------------------------------------------------
// OAuthClientStore
// ---------------------------------------------------------------------------

/// File-backed client registry.
#[derive(Clone)]
pub struct OAuthClientStore {
    file: JsonFile<ClientsDocument>,
    clock: SharedClock,
    default_expiration_minutes: i64,
}

impl OAuthClientStore {
    pub fn open(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            file: JsonFile::new(path),
            clock,
            default_expiration_minutes: DEFAULT_TOKEN_EXPIRATION_MINUTES,
        }
    }

    /// Token lifetime given to clients registered without one.
    pub fn with_default_expiration(mut self, minutes: i64) -> Self {
        self.default_expiration_minutes = minutes;
        self
    }

    /// Register a client. The returned secret is not recoverable later.
    #[instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create_oauth_client(
        &self,
        new: NewClient,
        created_by: &str,
    ) -> Result<IssuedClientSecret> {
        let client_id = format!("client_{}", uuid::Uuid::new_v4().simple());
        let secret = random_hex(TOKEN_BYTES)?;
        let grant_types = if new.grant_types.is_empty() {
            default_grant_types()
        } else {
            new.grant_types
        };

        let client = OAuthClient {
            client_id: client_id.clone(),
            client_secret: bcrypt_hash(secret.clone()).await?,
            name: new.name,
            description: new.description,
            scopes: new.scopes,
            allowed_apps: new.allowed_apps,
            allowed_models: new.allowed_models,
            token_expiration_minutes: new
                .token_expiration_minutes
                .unwrap_or(self.default_expiration_minutes),
            active: true,
            redirect_uris: new.redirect_uris,
            grant_types,
            client_type: new.client_type,
            created_at: self.clock.now(),
            created_by: created_by.to_string(),
            updated_at: None,
            updated_by: None,
            last_used: None,
            last_rotated: None,
            last_rotated_by: None,
        };
        validate_shape(&client)?;

        let redacted = client.redacted();
        self.file
            .update(move |doc| {
                doc.clients.insert(client_id, client);
                Change::Changed(())
            })
            .await?;

        info!(client_id = %redacted.client_id, created_by, "oauth client created");
        Ok(IssuedClientSecret {
            client: redacted,
            client_secret: secret,
        })
    }

    /// Replace the secret. The previous one stops working immediately.
    #[instrument(skip(self))]
    pub async fn rotate_client_secret(
        &self,
        client_id: &str,
        rotated_by: &str,
    ) -> Result<Option<IssuedClientSecret>> {
        let secret = random_hex(TOKEN_BYTES)?;
        let hash = bcrypt_hash(secret.clone()).await?;
        let now = self.clock.now();

        let rotated = self
            .file
            .update(|doc| match doc.clients.get_mut(client_id) {
                Some(client) => {
                    client.client_secret = hash;
                    client.last_rotated = Some(now);
                    client.last_rotated_by = Some(rotated_by.to_string());
                    Change::Changed(Some(client.redacted()))
                }
                None => Change::Unchanged(None),
            })
            .await?;

        Ok(rotated.map(|client| {
            info!(client_id, rotated_by, "oauth client secret rotated");
            IssuedClientSecret {
                client,
                client_secret: secret,
            }
        }))
    }

    /// Authenticate a client. `None` for unknown, inactive, or a wrong
    /// secret; callers must not tell these apart in responses.
    ///
    /// On success `lastUsed` is refreshed in the background, at most once
    /// per [`LAST_USED_THROTTLE_SECS`].
    #[instrument(skip(self, secret))]
    pub async fn validate_client_credentials(
        &self,
        client_id: &str,
        secret: &str,
    ) -> Result<Option<OAuthClient>> {
        let doc = self.file.load().await?;
        let Some(client) = doc.clients.get(client_id) else {
            debug!("unknown client");
            return Ok(None);
        };
        if !client.active {
            debug!("inactive client");
            return Ok(None);
        }
        if !bcrypt_verify(secret.to_string(), client.client_secret.clone()).await? {
            warn!(client_id, "client secret mismatch");
            return Ok(None);
        }

        let now = self.clock.now();
        if should_touch(client.last_used, now) {
            self.touch_last_used(client_id.to_string(), now);
        }
        Ok(Some(client.redacted()))
    }

    fn touch_last_used(&self, client_id: String, now: DateTime<Utc>) {
        let file = self.file.clone();
        tokio::spawn(async move {
            let outcome = file
                .update(|doc| match doc.clients.get_mut(&client_id) {
                    Some(client) if should_touch(client.last_used, now) => {
                        client.last_used = Some(now);
                        Change::Changed(())
                    }
                    _ => Change::Unchanged(()),
                })
                .await;
            if let Err(err) = outcome {
                warn!(%client_id, %err, "failed to record client last use");
            }
        });
    }

    /// Apply an allow-listed update.
    #[instrument(skip(self, update))]
    pub async fn update_oauth_client(
        &self,
        client_id: &str,
        update: ClientUpdate,
        updated_by: &str,
    ) -> Result<Option<OAuthClient>> {
        let now = self.clock.now();
        let updated = self
            .file
            .update(|doc| {
                let Some(current) = doc.clients.get(client_id) else {
                    return Change::Unchanged(Ok(None));
                };
                let mut next = current.clone();
                if let Some(v) = update.name {
                    next.name = v;
                }
                if let Some(v) = update.description {
                    next.description = Some(v);
                }
                if let Some(v) = update.scopes {
                    next.scopes = v;
                }
                if let Some(v) = update.allowed_apps {
                    next.allowed_apps = v;
                }
                if let Some(v) = update.allowed_models {
                    next.allowed_models = v;
                }
                if let Some(v) = update.token_expiration_minutes {
                    next.token_expiration_minutes = v;
                }
                if let Some(v) = update.active {
                    next.active = v;
                }
                if let Some(v) = update.redirect_uris {
                    next.redirect_uris = v;
                }
                if let Some(v) = update.grant_types {
                    next.grant_types = v;
                }
                if let Err(err) = validate_shape(&next) {
                    return Change::Unchanged(Err(err));
                }
                next.updated_at = Some(now);
                next.updated_by = Some(updated_by.to_string());
                let redacted = next.redacted();
                doc.clients.insert(client_id.to_string(), next);
                Change::Changed(Ok(Some(redacted)))
            })
            .await??;

        if updated.is_some() {
            info!(client_id, updated_by, "oauth client updated");
        }
        Ok(updated)
    }

    /// Remove a client. Returns whether it existed.
    ///
    /// Tokens and consent bound to the client are not touched here; use
    /// `AuthorizationServer::delete_client` for the cascading variant.
    #[instrument(skip(self))]
    pub async fn delete_oauth_client(&self, client_id: &str) -> Result<bool> {
        let removed = self
            .file
            .update(|doc| match doc.clients.remove(client_id) {
                Some(_) => Change::Changed(true),
                None => Change::Unchanged(false),
            })
            .await?;
        if removed {
            info!(client_id, "oauth client deleted");
        }
        Ok(removed)
    }

    /// Every client, secrets redacted.
    pub async fn list_oauth_clients(&self) -> Result<Vec<OAuthClient>> {
        let doc = self.file.load().await?;
        Ok(doc.clients.values().map(OAuthClient::redacted).collect())
    }

    /// One client, secret redacted.
    pub async fn find_oauth_client(&self, client_id: &str) -> Result<Option<OAuthClient>> {
        let doc = self.file.load().await?;
        Ok(doc.clients.get(client_id).map(OAuthClient::redacted))
    }

    pub async fn is_redirect_uri_allowed(&self, client_id: &str, uri: &str) -> Result<bool> {
        Ok(self
            .find_oauth_client(client_id)
            .await?
            .is_some_and(|c| c.allows_redirect_uri(uri)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
