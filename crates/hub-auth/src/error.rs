//! Error types for the hub-auth crate.
//!
//! Protocol failures map onto the RFC 6749 `error` codes through
//! [`AuthError::oauth_error_code`]. The description sent to a client comes
//! from [`AuthError::public_description`] and never says which check failed.

use thiserror::Error;

/// Unified error type for the authorization server.
#[derive(Debug, Error)]
pub enum AuthError {
    // -- Protocol -----------------------------------------------------------
    /// The authorization code or refresh token is unknown, expired, replayed,
    /// or bound to something else (client, redirect URI, PKCE verifier).
    #[error("invalid grant: {reason}")]
    InvalidGrant { reason: String },

    /// Client authentication failed: unknown, inactive, or bad secret.
    #[error("invalid client: {reason}")]
    InvalidClient { reason: String },

    /// A requested scope is not granted to the client.
    #[error("invalid scope: {scope}")]
    InvalidScope { scope: String },

    /// The request is missing a parameter or carries an unsupported value.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The client may not use the requested grant type.
    #[error("unauthorized client: {reason}")]
    UnauthorizedClient { reason: String },

    // -- Deployment ---------------------------------------------------------
    /// No usable JWT signing material could be resolved.
    #[error("missing signing key: {reason}")]
    MissingSigningKey { reason: String },

    /// Randomness or key generation failed.
    #[error("crypto failure: {reason}")]
    Crypto { reason: String },

    // -- Underlying ---------------------------------------------------------
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("hashing error: {0}")]
    Hashing(#[from] bcrypt::BcryptError),

    #[error(transparent)]
    Store(#[from] hub_store::StoreError),

    #[error(transparent)]
    Access(#[from] hub_access::AccessError),

    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl AuthError {
    pub(crate) fn grant(reason: impl Into<String>) -> Self {
        Self::InvalidGrant {
            reason: reason.into(),
        }
    }

    pub(crate) fn client(reason: impl Into<String>) -> Self {
        Self::InvalidClient {
            reason: reason.into(),
        }
    }

    pub(crate) fn request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// RFC 6749 section 5.2 `error` value.
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidGrant { .. } => "invalid_grant",
            Self::InvalidClient { .. } => "invalid_client",
            Self::InvalidScope { .. } => "invalid_scope",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::UnauthorizedClient { .. } => "unauthorized_client",
            _ => "server_error",
        }
    }

    /// Client-facing `error_description`.
    pub fn public_description(&self) -> &'static str {
        match self {
            Self::InvalidGrant { .. } => "The provided authorization grant is invalid or expired",
            Self::InvalidClient { .. } => "Client authentication failed",
            Self::InvalidScope { .. } => "The requested scope is invalid or exceeds the granted scope",
            Self::InvalidRequest { .. } => "The request is missing a required parameter or is malformed",
            Self::UnauthorizedClient { .. } => "The client is not authorized to use this grant type",
            _ => "The authorization server encountered an unexpected condition",
        }
    }

    /// HTTP status a token endpoint answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidClient { .. } => 401,
            Self::InvalidGrant { .. }
            | Self::InvalidScope { .. }
            | Self::InvalidRequest { .. }
            | Self::UnauthorizedClient { .. } => 400,
            _ => 500,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
