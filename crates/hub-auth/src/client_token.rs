//! Machine-to-machine tokens (client credentials grant).
//!
//! Issued tokens carry the client id and granted scopes only. App and model
//! restrictions are read from the live client record on every request, so
//! narrowing a client's access applies to tokens already in circulation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::client::{OAuthClient, OAuthClientStore};
use crate::error::{AuthError, Result};
use crate::jwt::TokenService;
use crate::lifetime;

/// `authMode` claim of client credentials tokens and static API keys.
pub const CLIENT_CREDENTIALS_AUTH_MODE: &str = "oauth_client_credentials";

/// `tokenUse` claim value marking a static API key.
pub const STATIC_API_KEY_USE: &str = "static_api_key";

/// Default static API key lifetime.
pub const DEFAULT_API_KEY_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientClaims {
    pub sub: String,
    #[serde(rename = "client_id")]
    pub client_id: String,
    pub client_name: String,
    pub auth_mode: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_use: Option<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClientTokenOptions {
    /// Must be a subset of the client's scopes. `None` grants all of them.
    pub requested_scopes: Option<Vec<String>>,
    /// Overrides the client's `tokenExpirationMinutes`.
    pub expires_in_minutes: Option<i64>,
}

/// A signed client token.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientToken {
    pub access_token: String,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

/// RFC 7662 style introspection result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Introspection {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl Introspection {
    pub fn inactive() -> Self {
        Self::default()
    }
}

impl From<ClientClaims> for Introspection {
    fn from(c: ClientClaims) -> Self {
        Self {
            active: true,
            client_id: Some(c.client_id),
            scope: Some(c.scopes.join(" ")),
            sub: Some(c.sub),
            exp: Some(c.exp),
            iat: Some(c.iat),
            iss: Some(c.iss),
            aud: Some(c.aud),
            token_type: Some("Bearer".into()),
        }
    }
}

/// Issues and checks client credentials tokens.
#[derive(Debug, Clone)]
pub struct OAuthTokenService {
    tokens: TokenService,
}

impl OAuthTokenService {
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }

    pub fn token_service(&self) -> &TokenService {
        &self.tokens
    }

    /// Issue an access token for `client`.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidScope`] if a requested scope is not registered
    /// for the client.
    #[instrument(skip(self, client, options), fields(client_id = %client.client_id))]
    pub fn generate_oauth_token(
        &self,
        client: &OAuthClient,
        options: ClientTokenOptions,
    ) -> Result<ClientToken> {
        let scopes = match options.requested_scopes {
            Some(requested) => {
                if let Some(missing) = requested.iter().find(|s| !client.scopes.contains(*s)) {
                    return Err(AuthError::InvalidScope {
                        scope: missing.clone(),
                    });
                }
                requested
            }
            None => client.scopes.clone(),
        };
        let minutes = options
            .expires_in_minutes
            .unwrap_or(client.token_expiration_minutes);
        let token = self.issue(client, scopes, lifetime::token_minutes(minutes)?, None)?;
        debug!(expires_in = token.expires_in, "client token issued");
        Ok(token)
    }

    /// Issue a long-lived key with the client's full scope set.
    #[instrument(skip(self, client), fields(client_id = %client.client_id))]
    pub fn generate_static_api_key(
        &self,
        client: &OAuthClient,
        expiration_days: Option<i64>,
    ) -> Result<ClientToken> {
        let days = expiration_days.unwrap_or(DEFAULT_API_KEY_DAYS);
        let token = self.issue(
            client,
            client.scopes.clone(),
            lifetime::ttl_days(days)?,
            Some(STATIC_API_KEY_USE.to_string()),
        )?;
        info!(days, "static api key issued");
        Ok(token)
    }

    fn issue(
        &self,
        client: &OAuthClient,
        scopes: Vec<String>,
        valid_for: Duration,
        token_use: Option<String>,
    ) -> Result<ClientToken> {
        let now = self.tokens.now();
        let expires_at = lifetime::expiry(now, valid_for)?;
        let claims = ClientClaims {
            sub: client.client_id.clone(),
            client_id: client.client_id.clone(),
            client_name: client.name.clone(),
            auth_mode: CLIENT_CREDENTIALS_AUTH_MODE.to_string(),
            scopes: scopes.clone(),
            token_use,
            iss: self.tokens.issuer().to_string(),
            aud: self.tokens.audience().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        Ok(ClientToken {
            access_token: self.tokens.sign(&claims)?,
            expires_in: valid_for.num_seconds(),
            expires_at,
            scopes,
        })
    }

    /// Verify a client token. Expired tokens, bad signatures, and tokens of
    /// another `authMode` are all `None`.
    pub fn verify_oauth_token(&self, token: &str) -> Option<ClientClaims> {
        let claims: ClientClaims = self.tokens.verify_as(token, self.tokens.audience())?;
        if claims.auth_mode != CLIENT_CREDENTIALS_AUTH_MODE {
            debug!(auth_mode = %claims.auth_mode, "not a client credentials token");
            return None;
        }
        Some(claims)
    }

    pub fn introspect_oauth_token(&self, token: &str) -> Introspection {
        self.verify_oauth_token(token)
            .map(Introspection::from)
            .unwrap_or_else(Introspection::inactive)
    }

    /// Verify `token` and check it against the live client record: the
    /// client must still exist and be active, and may reach `app_id` /
    /// `model_id` when given.
    pub async fn authorize_request(
        &self,
        clients: &OAuthClientStore,
        token: &str,
        app_id: Option<&str>,
        model_id: Option<&str>,
    ) -> Result<Option<ClientClaims>> {
        let Some(claims) = self.verify_oauth_token(token) else {
            return Ok(None);
        };
        let Some(client) = clients.find_oauth_client(&claims.client_id).await? else {
            debug!(client_id = %claims.client_id, "token for a deleted client");
            return Ok(None);
        };
        if !client.active {
            return Ok(None);
        }
        if let Some(app) = app_id
            && !Self::validate_app_access(&client.allowed_apps, app)
        {
            return Ok(None);
        }
        if let Some(model) = model_id
            && !Self::validate_model_access(&client.allowed_models, model)
        {
            return Ok(None);
        }
        Ok(Some(claims))
    }

    // -- Predicates ---------------------------------------------------------

    /// Every `required` scope is in `granted`. Nothing required passes.
    pub fn validate_scopes(granted: &[String], required: &[String]) -> bool {
        required.iter().all(|r| granted.contains(r))
    }

    /// An empty allow-list admits every app.
    pub fn validate_app_access(allowed_apps: &[String], app_id: &str) -> bool {
        allowed_apps.is_empty() || allowed_apps.iter().any(|a| a == app_id)
    }

    /// An empty allow-list admits every model.
    pub fn validate_model_access(allowed_models: &[String], model_id: &str) -> bool {
        allowed_models.is_empty() || allowed_models.iter().any(|m| m == model_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hub_access::{JwtSettings, Permissions, SessionUser};
    use hub_store::ManualClock;

    use super::*;
    use crate::client::NewClient;
    use crate::jwt::JwtOptions;
    use crate::keys::{KeySource, SigningKeys};

    fn service() -> (OAuthTokenService, ManualClock) {
        let clock = ManualClock::starting_now();
        let keys = SigningKeys::from_secret(b"client-token-test-secret-32-bytes", KeySource::Config);
        let tokens = TokenService::new(keys, &JwtSettings::default(), Arc::new(clock.clone()));
        (OAuthTokenService::new(tokens), clock)
    }

    fn client() -> OAuthClient {
        OAuthClient {
            client_id: "client_abc".into(),
            client_secret: String::new(),
            name: "Reporting".into(),
            description: None,
            scopes: vec!["chat".into(), "models:read".into()],
            allowed_apps: vec!["summarizer".into()],
            allowed_models: vec![],
            token_expiration_minutes: 30,
            active: true,
            redirect_uris: vec![],
            grant_types: vec![crate::client::GrantType::ClientCredentials],
            client_type: crate::client::ClientType::Confidential,
            created_at: Utc::now(),
            created_by: "admin".into(),
            updated_at: None,
            updated_by: None,
            last_used: None,
            last_rotated: None,
            last_rotated_by: None,
        }
    }

    fn strings(s: &[&str]) -> Vec<String> {
        s.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn grants_all_scopes_by_default() {
        let (svc, _) = service();
        let token = svc.generate_oauth_token(&client(), Default::default()).unwrap();
        assert_eq!(token.expires_in, 30 * 60);
        let claims = svc.verify_oauth_token(&token.access_token).unwrap();
        assert_eq!(claims.scopes, strings(&["chat", "models:read"]));
        assert_eq!(claims.auth_mode, CLIENT_CREDENTIALS_AUTH_MODE);
    }

    #[test]
    fn requested_scope_must_be_registered() {
        let (svc, _) = service();
        let ok = ClientTokenOptions {
            requested_scopes: Some(strings(&["chat"])),
            ..Default::default()
        };
        assert_eq!(svc.generate_oauth_token(&client(), ok).unwrap().scopes, strings(&["chat"]));

        let bad = ClientTokenOptions {
            requested_scopes: Some(strings(&["chat", "admin"])),
            ..Default::default()
        };
        let err = svc.generate_oauth_token(&client(), bad).unwrap_err();
        assert!(matches!(err, AuthError::InvalidScope { ref scope } if scope == "admin"));
    }

    #[test]
    fn allow_lists_are_not_in_the_token() {
        let (svc, _) = service();
        let token = svc.generate_oauth_token(&client(), Default::default()).unwrap();
        let decoded = TokenService::decode_jwt(&token.access_token).unwrap();
        assert!(decoded.claims.get("allowedApps").is_none());
        assert!(decoded.claims.get("allowedModels").is_none());
    }

    #[test]
    fn introspection_reports_expiry_as_inactive() {
        let (svc, clock) = service();
        let token = svc.generate_oauth_token(&client(), Default::default()).unwrap();

        let live = svc.introspect_oauth_token(&token.access_token);
        assert!(live.active);
        assert_eq!(live.client_id.as_deref(), Some("client_abc"));
        assert_eq!(live.scope.as_deref(), Some("chat models:read"));

        clock.advance(Duration::minutes(31));
        assert_eq!(svc.introspect_oauth_token(&token.access_token), Introspection::inactive());
        let json = serde_json::to_value(Introspection::inactive()).unwrap();
        assert_eq!(json, serde_json::json!({ "active": false }));
    }

    #[test]
    fn session_token_is_not_a_client_token() {
        let (svc, _) = service();
        let user = SessionUser {
            id: "user_123".into(),
            username: "alice".into(),
            name: None,
            email: None,
            groups: vec![],
            provider: None,
            auth_mode: "local".into(),
            permissions: Permissions::default(),
        };
        let session = svc
            .token_service()
            .generate_jwt(&user, JwtOptions::default())
            .unwrap();
        assert!(!svc.introspect_oauth_token(&session.token).active);
    }

    #[test]
    fn static_key_lasts_a_year() {
        let (svc, clock) = service();
        let key = svc.generate_static_api_key(&client(), None).unwrap();
        assert_eq!(key.expires_in, 365 * 24 * 3600);
        clock.advance(Duration::days(364));
        let claims = svc.verify_oauth_token(&key.access_token).unwrap();
        assert_eq!(claims.token_use.as_deref(), Some(STATIC_API_KEY_USE));
        assert!(svc.generate_static_api_key(&client(), Some(0)).is_err());
    }

    #[test]
    fn client_id_claim_keeps_its_oauth_name() {
        let (svc, _) = service();
        let token = svc.generate_oauth_token(&client(), Default::default()).unwrap();
        let payload = TokenService::decode_jwt(&token.access_token).unwrap().claims;
        assert_eq!(payload["client_id"], "client_abc");
        assert!(payload.get("clientId").is_none());
        assert_eq!(payload["clientName"], "Reporting");
        assert_eq!(payload["authMode"], CLIENT_CREDENTIALS_AUTH_MODE);
    }

    #[test]
    fn lifetimes_beyond_the_limit_are_rejected() {
        let (svc, _) = service();
        let huge = OAuthClient {
            token_expiration_minutes: i64::MAX / 1000,
            ..client()
        };
        let err = svc.generate_oauth_token(&huge, Default::default()).unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_request");

        let options = ClientTokenOptions {
            expires_in_minutes: Some(hub_access::MAX_TOKEN_LIFETIME_MINUTES + 1),
            ..Default::default()
        };
        assert!(svc.generate_oauth_token(&client(), options).is_err());

        let err = svc
            .generate_static_api_key(&client(), Some(i64::MAX))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
        assert!(svc
            .generate_static_api_key(&client(), Some(hub_access::MAX_TTL_DAYS))
            .is_ok());
    }

    #[test]
    fn predicates() {
        let granted = strings(&["a", "b"]);
        assert!(OAuthTokenService::validate_scopes(&granted, &strings(&["a"])));
        assert!(OAuthTokenService::validate_scopes(&granted, &[]));
        assert!(!OAuthTokenService::validate_scopes(&granted, &strings(&["c"])));

        assert!(OAuthTokenService::validate_app_access(&[], "anything"));
        assert!(OAuthTokenService::validate_app_access(&strings(&["x"]), "x"));
        assert!(!OAuthTokenService::validate_app_access(&strings(&["x"]), "y"));
        assert!(OAuthTokenService::validate_model_access(&[], "gpt"));
        assert!(!OAuthTokenService::validate_model_access(&strings(&["claude"]), "gpt"));
    }

    #[tokio::test]
    async fn live_client_record_governs_access() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, clock) = service();
        let store = OAuthClientStore::open(
            dir.path().join("oauth-clients.json"),
            Arc::new(clock.clone()),
        );
        let new = NewClient {
            name: "Reporting".into(),
            scopes: strings(&["chat"]),
            allowed_apps: strings(&["summarizer"]),
            ..Default::default()
        };
        let issued = store.create_oauth_client(new, "admin").await.unwrap();
        let id = issued.client.client_id.clone();
        let token = svc
            .generate_oauth_token(&issued.client, Default::default())
            .unwrap()
            .access_token;

        assert!(svc.authorize_request(&store, &token, Some("summarizer"), None).await.unwrap().is_some());
        assert!(svc.authorize_request(&store, &token, Some("translator"), None).await.unwrap().is_none());

        let update = crate::client::ClientUpdate {
            allowed_apps: Some(strings(&["translator"])),
            ..Default::default()
        };
        store.update_oauth_client(&id, update, "admin").await.unwrap();
        assert!(svc.authorize_request(&store, &token, Some("summarizer"), None).await.unwrap().is_none());

        store.delete_oauth_client(&id).await.unwrap();
        assert!(svc.authorize_request(&store, &token, None, None).await.unwrap().is_none());
    }
}
