//! Grant orchestration: the authorization endpoint decision, the token
//! endpoint grants, revocation and introspection, and cascading client
//! deletion.
//!
//! ```text
//! authorize ──► consent? ──► code ──► exchange_code ──► access + refresh
//!                                          refresh ◄──────────┘   (rotates)
//! client_credentials ──► access
//! ```

use std::path::Path;

use hub_access::{OAuthSettings, PlatformConfig, SessionUser};
use hub_store::{SharedClock, Sweeper};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::client::{GrantType, OAuthClient, OAuthClientStore};
use crate::client_token::{ClientTokenOptions, Introspection, OAuthTokenService};
use crate::code_store::{AuthorizationCodeData, AuthorizationCodeStore};
use crate::consent::ConsentStore;
use crate::error::{AuthError, Result};
use crate::jwt::{JwtOptions, TokenService};
use crate::lifetime;
use crate::pkce;
use crate::refresh::{RefreshTokenData, RefreshTokenStore};

/// `authMode` claim of tokens obtained through the authorization code grant.
pub const AUTHORIZATION_CODE_AUTH_MODE: &str = "oauth_authorization_code";

pub const REFRESH_TOKENS_FILE: &str = "oauth-refresh-tokens.json";
pub const CONSENT_FILE: &str = "oauth-consent.json";

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Parameters of an authorization request (RFC 6749 section 4.1.1).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthorizeRequest {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// Space separated. Empty requests every scope the client holds.
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
}

/// Where the user agent goes after a successful authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationRedirect {
    pub code: String,
    pub state: Option<String>,
    /// `redirect_uri` with `code` (and `state`) appended.
    pub location: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizeOutcome {
    /// The user has not approved these scopes for this client yet.
    ConsentRequired {
        client: OAuthClient,
        scopes: Vec<String>,
    },
    Redirect(AuthorizationRedirect),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodeExchangeRequest {
    pub code: String,
    pub redirect_uri: String,
    pub client_id: String,
    /// Absent for public clients.
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RefreshRequest {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Optional narrowing of the originally granted scopes.
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientCredentialsRequest {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

/// Successful token endpoint response (RFC 6749 section 5.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

impl TokenResponse {
    pub fn bearer(
        access_token: String,
        expires_in: i64,
        scopes: &[String],
        refresh_token: Option<String>,
    ) -> Self {
        Self {
            access_token,
            token_type: "Bearer".into(),
            expires_in,
            refresh_token,
            scope: scopes.join(" "),
        }
    }
}

/// Error response body (RFC 6749 section 5.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: String,
}

impl From<&AuthError> for ErrorResponse {
    fn from(err: &AuthError) -> Self {
        Self {
            error: err.oauth_error_code().into(),
            error_description: err.public_description().into(),
        }
    }
}

/// What a cascading client deletion removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientDeletion {
    pub existed: bool,
    pub refresh_tokens_revoked: usize,
    pub consents_revoked: usize,
}

fn parse_scope(scope: Option<&str>) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for s in scope.unwrap_or_default().split_whitespace() {
        if !scopes.iter().any(|x| x == s) {
            scopes.push(s.to_string());
        }
    }
    scopes
}

fn ensure_subset(requested: &[String], allowed: &[String]) -> Result<()> {
    match requested.iter().find(|s| !allowed.contains(*s)) {
        Some(scope) => Err(AuthError::InvalidScope {
            scope: scope.clone(),
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// AuthorizationServer
// ---------------------------------------------------------------------------

/// The OAuth 2.0 authorization server.
pub struct AuthorizationServer {
    settings: OAuthSettings,
    clients: OAuthClientStore,
    codes: AuthorizationCodeStore,
    refresh_tokens: RefreshTokenStore,
    consents: ConsentStore,
    tokens: TokenService,
    client_tokens: OAuthTokenService,
}

impl AuthorizationServer {
    /// Wire every store under `data_dir` according to `platform`.
    pub async fn open(data_dir: &Path, platform: &PlatformConfig, clock: SharedClock) -> Result<Self> {
        let settings = platform.oauth.clone();
        let tokens = TokenService::from_settings(&platform.jwt, data_dir, clock.clone()).await?;
        let clients = OAuthClientStore::open(data_dir.join(&settings.clients_file), clock.clone())
            .with_default_expiration(settings.default_token_expiration_minutes);
        let refresh_tokens = RefreshTokenStore::open(data_dir.join(REFRESH_TOKENS_FILE), clock.clone())
            .with_ttl_days(settings.refresh_token_ttl_days);
        let consents = ConsentStore::open(data_dir.join(CONSENT_FILE), clock.clone());
        let codes = AuthorizationCodeStore::new(clock);

        info!(
            data_dir = %data_dir.display(),
            enabled = settings.enabled,
            algorithm = %tokens.keys().algorithm(),
            "authorization server ready"
        );
        Ok(Self::from_parts(settings, clients, codes, refresh_tokens, consents, tokens))
    }

    pub fn from_parts(
        settings: OAuthSettings,
        clients: OAuthClientStore,
        codes: AuthorizationCodeStore,
        refresh_tokens: RefreshTokenStore,
        consents: ConsentStore,
        tokens: TokenService,
    ) -> Self {
        let client_tokens = OAuthTokenService::new(tokens.clone());
        Self {
            settings,
            clients,
            codes,
            refresh_tokens,
            consents,
            tokens,
            client_tokens,
        }
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    pub fn clients(&self) -> &OAuthClientStore {
        &self.clients
    }

    pub fn codes(&self) -> &AuthorizationCodeStore {
        &self.codes
    }

    pub fn refresh_tokens(&self) -> &RefreshTokenStore {
        &self.refresh_tokens
    }

    pub fn consents(&self) -> &ConsentStore {
        &self.consents
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn client_tokens(&self) -> &OAuthTokenService {
        &self.client_tokens
    }

    /// Start the authorization code expiry sweep.
    pub fn spawn_sweeper(&self) -> Sweeper {
        self.codes.spawn_sweeper()
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.settings.enabled {
            Ok(())
        } else {
            Err(AuthError::UnauthorizedClient {
                reason: "oauth is disabled".into(),
            })
        }
    }

    // -- Authorization endpoint ---------------------------------------------

    /// Decide an authorization request for the signed-in `user`.
    #[instrument(skip(self, request, user), fields(client_id = %request.client_id, user_id = %user.id))]
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        user: &SessionUser,
    ) -> Result<AuthorizeOutcome> {
        let (client, scopes) = self.validate_authorization(request).await?;
        if !self
            .consents
            .has_consent(&client.client_id, &user.id, &scopes, None)
            .await?
        {
            debug!("consent required");
            return Ok(AuthorizeOutcome::ConsentRequired { client, scopes });
        }
        let redirect = self.issue_code(request, &client, scopes, user).await?;
        Ok(AuthorizeOutcome::Redirect(redirect))
    }

    /// Record the user's approval, then issue the code.
    #[instrument(skip(self, request, user), fields(client_id = %request.client_id, user_id = %user.id))]
    pub async fn approve_consent(
        &self,
        request: &AuthorizeRequest,
        user: &SessionUser,
    ) -> Result<AuthorizationRedirect> {
        let (client, scopes) = self.validate_authorization(request).await?;
        self.consents
            .grant_consent(
                &client.client_id,
                &user.id,
                &scopes,
                Some(self.settings.consent_ttl_days),
            )
            .await?;
        self.issue_code(request, &client, scopes, user).await
    }

    async fn validate_authorization(
        &self,
        request: &AuthorizeRequest,
    ) -> Result<(OAuthClient, Vec<String>)> {
        self.ensure_enabled()?;
        if !self.settings.authorization_code_enabled {
            return Err(AuthError::UnauthorizedClient {
                reason: "authorization code grant is disabled".into(),
            });
        }

        let client = self
            .clients
            .find_oauth_client(&request.client_id)
            .await?
            .filter(|c| c.active)
            .ok_or_else(|| AuthError::client("unknown or inactive client"))?;

        // Checked before anything that could redirect back to the client.
        if !client.allows_redirect_uri(&request.redirect_uri) {
            warn!(redirect_uri = %request.redirect_uri, "unregistered redirect uri");
            return Err(AuthError::request("redirect uri is not registered"));
        }
        if request.response_type != "code" {
            return Err(AuthError::request(format!(
                "unsupported response type `{}`",
                request.response_type
            )));
        }
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(AuthError::UnauthorizedClient {
                reason: "client is not registered for authorization_code".into(),
            });
        }

        match (&request.code_challenge, request.code_challenge_method.as_deref()) {
            (Some(_), Some(method)) if pkce::is_supported_method(method) => {}
            (Some(_), method) => {
                return Err(AuthError::request(format!(
                    "unsupported code challenge method `{}`",
                    method.unwrap_or("plain")
                )));
            }
            (None, _) if client.is_public() => {
                return Err(AuthError::request("public clients must use PKCE"));
            }
            (None, _) => {}
        }

        let mut scopes = parse_scope(request.scope.as_deref());
        if scopes.is_empty() {
            scopes = client.scopes.clone();
        }
        ensure_subset(&scopes, &client.scopes)?;
        Ok((client, scopes))
    }

    async fn issue_code(
        &self,
        request: &AuthorizeRequest,
        client: &OAuthClient,
        scopes: Vec<String>,
        user: &SessionUser,
    ) -> Result<AuthorizationRedirect> {
        let context = match serde_json::to_value(user) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let code = self.codes.generate_code()?;
        self.codes
            .store_code(
                &code,
                AuthorizationCodeData {
                    client_id: client.client_id.clone(),
                    redirect_uri: request.redirect_uri.clone(),
                    user_id: user.id.clone(),
                    scopes,
                    code_challenge: request.code_challenge.clone(),
                    code_challenge_method: request
                        .code_challenge
                        .as_ref()
                        .map(|_| pkce::S256.to_string()),
                    nonce: request.nonce.clone(),
                    context,
                },
            )
            .await?;

        let mut location = Url::parse(&request.redirect_uri)
            .map_err(|e| AuthError::request(format!("redirect uri: {e}")))?;
        {
            let mut query = location.query_pairs_mut();
            query.append_pair("code", &code);
            if let Some(state) = &request.state {
                query.append_pair("state", state);
            }
        }
        info!(client_id = %client.client_id, user_id = %user.id, "authorization code issued");
        Ok(AuthorizationRedirect {
            code,
            state: request.state.clone(),
            location: location.into(),
        })
    }

    // -- Token endpoint -----------------------------------------------------

    /// Confidential clients authenticate with their secret; public clients
    /// present none.
    async fn authenticate_client(&self, client_id: &str, secret: Option<&str>) -> Result<OAuthClient> {
        match secret {
            Some(secret) => self
                .clients
                .validate_client_credentials(client_id, secret)
                .await?
                .ok_or_else(|| AuthError::client("bad client credentials")),
            None => self
                .clients
                .find_oauth_client(client_id)
                .await?
                .filter(|c| c.active && c.is_public())
                .ok_or_else(|| AuthError::client("client secret required")),
        }
    }

    /// `grant_type=authorization_code`
    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn exchange_code(&self, request: &CodeExchangeRequest) -> Result<TokenResponse> {
        self.ensure_enabled()?;
        let client = self
            .authenticate_client(&request.client_id, request.client_secret.as_deref())
            .await?;
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(AuthError::UnauthorizedClient {
                reason: "client is not registered for authorization_code".into(),
            });
        }

        let data = self
            .codes
            .consume_code(&request.code)
            .await?
            .ok_or_else(|| AuthError::grant("unknown, expired, or replayed code"))?;
        if data.client_id != client.client_id {
            warn!(bound_to = %data.client_id, "code presented by another client");
            return Err(AuthError::grant("code was issued to another client"));
        }
        if data.redirect_uri != request.redirect_uri {
            return Err(AuthError::grant("redirect uri mismatch"));
        }
        match (&data.code_challenge, request.code_verifier.as_deref()) {
            (Some(challenge), Some(verifier)) => {
                let method = data.code_challenge_method.as_deref().unwrap_or(pkce::S256);
                if !pkce::verify_code_challenge(verifier, challenge, method) {
                    return Err(AuthError::grant("pkce verification failed"));
                }
            }
            (Some(_), None) => return Err(AuthError::grant("code verifier missing")),
            (None, Some(_)) => return Err(AuthError::grant("code was issued without a challenge")),
            (None, None) => {}
        }

        let session = session_from_context(&data.context, &data.user_id)?;
        let (access_token, expires_in) =
            self.mint_access_token(&client, &session, &data.scopes, data.nonce.as_deref())?;
        let refresh_token = self
            .issue_refresh_token(&client, &data.user_id, &data.scopes, data.context)
            .await?;

        info!(user_id = %data.user_id, "authorization code exchanged");
        Ok(TokenResponse::bearer(access_token, expires_in, &data.scopes, refresh_token))
    }

    /// `grant_type=refresh_token`. The presented token is consumed only
    /// once the request has been validated and a new one is issued with the
    /// original scopes. A rejected request leaves the token redeemable.
    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn refresh(&self, request: &RefreshRequest) -> Result<TokenResponse> {
        self.ensure_enabled()?;
        let client = self
            .authenticate_client(&request.client_id, request.client_secret.as_deref())
            .await?;
        if !client.allows_grant(GrantType::RefreshToken) {
            return Err(AuthError::UnauthorizedClient {
                reason: "client is not registered for refresh_token".into(),
            });
        }

        let requested = parse_scope(request.scope.as_deref());
        let redeemed = self
            .refresh_tokens
            .consume_refresh_token_with(&request.refresh_token, |data| {
                if data.client_id != client.client_id {
                    warn!(bound_to = %data.client_id, "refresh token presented by another client");
                    return Err(AuthError::grant("refresh token was issued to another client"));
                }
                let scopes = if requested.is_empty() {
                    data.scopes.clone()
                } else {
                    ensure_subset(&requested, &data.scopes)?;
                    requested.clone()
                };
                let session = session_from_context(&data.context, &data.user_id)?;
                let (access_token, expires_in) =
                    self.mint_access_token(&client, &session, &scopes, None)?;
                Ok((scopes, access_token, expires_in))
            })
            .await?;
        let Some((data, (scopes, access_token, expires_in))) = redeemed else {
            return Err(AuthError::grant("unknown, expired, or used refresh token"));
        };

        let refresh_token = self
            .issue_refresh_token(&client, &data.user_id, &data.scopes, data.context)
            .await?;

        debug!(user_id = %data.user_id, "refresh token rotated");
        Ok(TokenResponse::bearer(access_token, expires_in, &scopes, refresh_token))
    }

    /// `grant_type=client_credentials`
    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn client_credentials(&self, request: &ClientCredentialsRequest) -> Result<TokenResponse> {
        self.ensure_enabled()?;
        let client = self
            .authenticate_client(&request.client_id, Some(request.client_secret.as_str()))
            .await?;
        if !client.allows_grant(GrantType::ClientCredentials) {
            return Err(AuthError::UnauthorizedClient {
                reason: "client is not registered for client_credentials".into(),
            });
        }
        let requested = parse_scope(request.scope.as_deref());
        let options = ClientTokenOptions {
            requested_scopes: (!requested.is_empty()).then_some(requested),
            expires_in_minutes: None,
        };
        let token = self.client_tokens.generate_oauth_token(&client, options)?;
        Ok(TokenResponse::bearer(
            token.access_token,
            token.expires_in,
            &token.scopes,
            None,
        ))
    }

    fn mint_access_token(
        &self,
        client: &OAuthClient,
        session: &SessionUser,
        scopes: &[String],
        nonce: Option<&str>,
    ) -> Result<(String, i64)> {
        let mut session = session.clone();
        session.auth_mode = AUTHORIZATION_CODE_AUTH_MODE.to_string();

        let mut additional_claims = Map::new();
        additional_claims.insert("client_id".into(), Value::String(client.client_id.clone()));
        additional_claims.insert("scope".into(), Value::String(scopes.join(" ")));
        if let Some(nonce) = nonce {
            additional_claims.insert("nonce".into(), Value::String(nonce.to_string()));
        }
        let issued = self.tokens.generate_jwt(
            &session,
            JwtOptions {
                expires_in: Some(lifetime::token_minutes(client.token_expiration_minutes)?),
                additional_claims,
            },
        )?;
        Ok((issued.token, issued.expires_in))
    }

    async fn issue_refresh_token(
        &self,
        client: &OAuthClient,
        user_id: &str,
        scopes: &[String],
        context: Map<String, Value>,
    ) -> Result<Option<String>> {
        if !client.allows_grant(GrantType::RefreshToken) {
            return Ok(None);
        }
        let token = self.refresh_tokens.generate_refresh_token()?;
        self.refresh_tokens
            .store_refresh_token(
                &token,
                RefreshTokenData {
                    client_id: client.client_id.clone(),
                    user_id: user_id.to_string(),
                    scopes: scopes.to_vec(),
                    context,
                },
                Some(self.settings.refresh_token_ttl_days),
            )
            .await?;
        Ok(Some(token))
    }

    // -- Revocation / introspection -----------------------------------------

    /// RFC 7009 revocation. Unknown tokens and access tokens succeed
    /// silently; access tokens simply run out.
    #[instrument(skip(self, token))]
    pub async fn revoke(&self, token: &str) -> Result<()> {
        if self.refresh_tokens.revoke_refresh_token(token).await? {
            info!("refresh token revoked");
        }
        Ok(())
    }

    /// Introspect a client credentials token or an access token issued by
    /// the authorization code grant.
    pub fn introspect(&self, token: &str) -> Introspection {
        let client = self.client_tokens.introspect_oauth_token(token);
        if client.active {
            return client;
        }
        let Some(claims) = self.tokens.verify_jwt(token) else {
            return Introspection::inactive();
        };
        if claims.auth_mode != AUTHORIZATION_CODE_AUTH_MODE {
            return Introspection::inactive();
        }
        Introspection {
            active: true,
            client_id: claims
                .extra
                .get("client_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            scope: claims
                .extra
                .get("scope")
                .and_then(Value::as_str)
                .map(str::to_string),
            sub: Some(claims.sub),
            exp: Some(claims.exp),
            iat: Some(claims.iat),
            iss: Some(claims.iss),
            aud: Some(claims.aud),
            token_type: Some("Bearer".into()),
        }
    }

    // -- Client lifecycle ---------------------------------------------------

    /// Delete a client along with its refresh tokens and consent records.
    #[instrument(skip(self))]
    pub async fn delete_client(&self, client_id: &str) -> Result<ClientDeletion> {
        let existed = self.clients.delete_oauth_client(client_id).await?;
        let refresh_tokens_revoked = self.refresh_tokens.revoke_for_client(client_id).await?;
        let consents_revoked = self.consents.revoke_for_client(client_id).await?;
        info!(
            client_id,
            existed, refresh_tokens_revoked, consents_revoked, "client deleted"
        );
        Ok(ClientDeletion {
            existed,
            refresh_tokens_revoked,
            consents_revoked,
        })
    }
}

/// Rebuild the session stored alongside a code or refresh token.
fn session_from_context(context: &Map<String, Value>, user_id: &str) -> Result<SessionUser> {
    let session: SessionUser = serde_json::from_value(Value::Object(context.clone()))
        .map_err(|_| AuthError::grant("grant carries no usable session"))?;
    if session.id != user_id {
        return Err(AuthError::grant("grant session does not match its user"));
    }
    Ok(session)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
