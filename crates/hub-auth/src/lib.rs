//! # hub-auth
//!
//! OAuth 2.0 authorization server core and session token service.
//!
//! ```text
//!                       AuthorizationServer
//!     ┌──────────────┬─────────┼──────────┬───────────────┐
//!     ▼              ▼         ▼          ▼               ▼
//! OAuthClientStore  Codes   Refresh    Consent    TokenService ◄── SigningKeys
//! (bcrypt secrets) (memory) (sha256 +  (superset       │          (env / config /
//!                           bcrypt)     check)         ▼           generated)
//!                                               OAuthTokenService
//! ```
//!
//! PKCE is S256 only. Refresh tokens rotate on every successful use. Store-level
//! "not found / expired / replayed" outcomes are `None` or `false`; the
//! server turns them into RFC 6749 errors via [`AuthError`].

pub mod client;
pub mod client_token;
pub mod code_store;
pub mod consent;
pub mod crypto;
pub mod error;
pub mod jwt;
pub mod keys;
pub mod lifetime;
pub mod pkce;
pub mod refresh;
pub mod server;

// ── re-exports ───────────────────────────────────────────────────────

pub use client::{
    ClientType, ClientUpdate, GrantType, IssuedClientSecret, NewClient, OAuthClient,
    OAuthClientStore,
};
pub use client_token::{
    CLIENT_CREDENTIALS_AUTH_MODE, ClientClaims, ClientToken, ClientTokenOptions, Introspection,
    OAuthTokenService,
};
pub use code_store::{AuthorizationCodeData, AuthorizationCodeStore};
pub use consent::{ConsentEntry, ConsentStore};
pub use error::{AuthError, Result};
pub use jwt::{Claims, DecodedToken, IssuedToken, JwtOptions, TokenService};
pub use keys::{Jwk, JwkSet, KeySource, SigningKeys, resolve_signing_keys};
pub use refresh::{RefreshTokenData, RefreshTokenStore};
pub use server::{
    AUTHORIZATION_CODE_AUTH_MODE, AuthorizationRedirect, AuthorizationServer, AuthorizeOutcome,
    AuthorizeRequest, ClientCredentialsRequest, ClientDeletion, CodeExchangeRequest,
    ErrorResponse, RefreshRequest, TokenResponse,
};
