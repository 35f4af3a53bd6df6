//! Session JWT issuance and verification.
//!
//! Verification accepts exactly the configured algorithm, checks issuer and
//! audience, and reads expiry against the injected clock. Every failure is
//! reported as `None`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hub_access::{JwtSettings, SessionUser};
use hub_store::SharedClock;
use jsonwebtoken::{DecodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::error::{AuthError, Result};
use crate::keys::{JwkSet, SigningKeys, resolve_signing_keys};
use crate::lifetime;

/// Claims the service owns; additional claims may not override them.
const RESERVED_CLAIMS: &[&str] = &[
    "sub", "name", "email", "groups", "provider", "authMode", "authProvider", "iss", "aud", "iat",
    "nbf", "exp", "jti",
];

/// Claims of a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(rename = "authMode")]
    pub auth_mode: String,
    /// Identity provider that authenticated the session.
    #[serde(rename = "authProvider", default, skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-token overrides for [`TokenService::generate_jwt`].
#[derive(Debug, Clone, Default)]
pub struct JwtOptions {
    /// Defaults to the configured lifetime (8 hours unless changed).
    pub expires_in: Option<Duration>,
    /// Merged into the payload. An `aud` entry replaces the configured
    /// audience; other reserved names are dropped.
    pub additional_claims: Map<String, Value>,
}

/// A freshly signed token.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
    /// Lifetime in seconds, as reported in token responses.
    pub expires_in: i64,
}

/// Header and payload of a token read without verification.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedToken {
    pub header: Header,
    pub claims: Value,
}

/// Signs and verifies JWTs with one resolved key.
#[derive(Clone)]
pub struct TokenService {
    keys: Arc<SigningKeys>,
    issuer: String,
    audience: String,
    default_lifetime: Duration,
    clock: SharedClock,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("keys", &self.keys)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("default_lifetime", &self.default_lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(keys: SigningKeys, settings: &JwtSettings, clock: SharedClock) -> Self {
        let default_lifetime =
            lifetime::token_minutes(settings.expires_in_minutes).unwrap_or_else(|e| {
                warn!(err = %e, "invalid session token lifetime, using 8 hours");
                Duration::hours(8)
            });
        Self {
            keys: Arc::new(keys),
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            default_lifetime,
            clock,
        }
    }

    /// Resolve signing keys for `settings` and build the service.
    pub async fn from_settings(
        settings: &JwtSettings,
        data_dir: &Path,
        clock: SharedClock,
    ) -> Result<Self> {
        let keys = resolve_signing_keys(settings, data_dir).await?;
        Ok(Self::new(keys, settings, clock))
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn keys(&self) -> &SigningKeys {
        &self.keys
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Published verification keys.
    pub fn jwks(&self) -> JwkSet {
        self.keys.jwks()
    }

    // -- Session tokens -----------------------------------------------------

    /// Issue a session token for `user`.
    #[instrument(skip(self, user, options), fields(user_id = %user.id))]
    pub fn generate_jwt(&self, user: &SessionUser, options: JwtOptions) -> Result<IssuedToken> {
        let JwtOptions {
            expires_in,
            mut additional_claims,
        } = options;

        let audience = match additional_claims.remove("aud") {
            Some(Value::String(aud)) => aud,
            Some(other) => {
                return Err(AuthError::request(format!(
                    "aud claim must be a string, got {other}"
                )));
            }
            None => self.audience.clone(),
        };
        for reserved in RESERVED_CLAIMS {
            if additional_claims.remove(*reserved).is_some() {
                warn!(claim = reserved, "ignoring reserved claim in additional claims");
            }
        }

        let now = self.now();
        let valid_for = expires_in.unwrap_or(self.default_lifetime);
        let expires_at = lifetime::expiry(now, valid_for)?;
        let jti = uuid::Uuid::new_v4().to_string();
        let claims = Claims {
            sub: user.id.clone(),
            name: Some(user.name.clone().unwrap_or_else(|| user.username.clone())),
            email: user.email.clone(),
            groups: user.groups.clone(),
            provider: user.provider.clone(),
            auth_mode: user.auth_mode.clone(),
            auth_provider: user.provider.clone(),
            iss: self.issuer.clone(),
            aud: audience,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: jti.clone(),
            extra: additional_claims,
        };

        let token = self.sign(&claims)?;
        debug!(%expires_at, "session token issued");
        Ok(IssuedToken {
            token,
            jti,
            expires_at,
            expires_in: valid_for.num_seconds(),
        })
    }

    /// Verify a session token against the configured audience.
    pub fn verify_jwt(&self, token: &str) -> Option<Claims> {
        self.verify_as(token, &self.audience)
    }

    /// Verify a session token minted for a different audience.
    pub fn verify_jwt_with_audience(&self, token: &str, audience: &str) -> Option<Claims> {
        self.verify_as(token, audience)
    }

    /// Read a token without checking anything. Diagnostics only.
    pub fn decode_jwt(token: &str) -> Option<DecodedToken> {
        let header = jsonwebtoken::decode_header(token).ok()?;
        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        let data = jsonwebtoken::decode::<Value>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()?;
        Some(DecodedToken {
            header: data.header,
            claims: data.claims,
        })
    }

    // -- Shared plumbing ----------------------------------------------------

    /// Sign arbitrary claims with the active key.
    pub(crate) fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(self.keys.jwt_algorithm());
        header.kid = self.keys.kid().map(str::to_string);
        Ok(jsonwebtoken::encode(&header, claims, self.keys.encoding_key())?)
    }

    /// Verify signature, algorithm, issuer, audience, and expiry, then
    /// deserialize the payload as `T`.
    pub(crate) fn verify_as<T: DeserializeOwned>(&self, token: &str, audience: &str) -> Option<T> {
        let mut validation = Validation::new(self.keys.jwt_algorithm());
        validation.algorithms = vec![self.keys.jwt_algorithm()];
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;

        let data = match jsonwebtoken::decode::<Value>(token, self.keys.decoding_key(), &validation) {
            Ok(data) => data,
            Err(err) => {
                debug!(%err, "token rejected");
                return None;
            }
        };

        let exp = data.claims.get("exp").and_then(Value::as_i64)?;
        if exp <= self.now().timestamp() {
            debug!(exp, "token expired");
            return None;
        }

        match serde_json::from_value(data.claims) {
            Ok(claims) => Some(claims),
            Err(err) => {
                debug!(%err, "token payload has an unexpected shape");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
