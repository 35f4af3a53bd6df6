//! Platform configuration and the configuration cache.
//!
//! `platform.json` is camelCase JSON. Every section is optional and falls
//! back to its defaults, so a missing file yields a working local-auth setup.
//!
//! ```json
//! {
//!   "auth": { "mode": "oidc", "authenticatedGroup": "authenticated" },
//!   "oidcAuth": { "enabled": true, "allowSelfSignup": false,
//!                 "defaultGroups": ["users"],
//!                 "providers": [{ "name": "entra", "defaultGroups": ["staff"] }] },
//!   "jwt": { "algorithm": "RS256", "expiresInMinutes": 480 },
//!   "oauth": { "enabled": true, "consentTtlDays": 90 }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use hub_store::JsonFile;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AccessError, Result};
use crate::group::GroupsDocument;
use crate::resolver::GroupPermissionResolver;

// ---------------------------------------------------------------------------
// Auth methods
// ---------------------------------------------------------------------------

/// How a principal authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Local,
    Oidc,
    Proxy,
    Ldap,
    Ntlm,
    Teams,
    Anonymous,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Oidc => "oidc",
            Self::Proxy => "proxy",
            Self::Ldap => "ldap",
            Self::Ntlm => "ntlm",
            Self::Teams => "teams",
            Self::Anonymous => "anonymous",
        }
    }

    /// Methods that already authenticate behind a trusted perimeter and
    /// therefore allow self-signup unless configured otherwise.
    pub fn trusts_perimeter(self) -> bool {
        matches!(self, Self::Ntlm | Self::Proxy)
    }

    /// Directory-backed methods whose admin rights come from configuration
    /// (default groups and mappings) rather than stored assignments.
    pub fn is_config_derived(self) -> bool {
        matches!(self, Self::Ldap | Self::Ntlm)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "local" => Self::Local,
            "oidc" => Self::Oidc,
            "proxy" => Self::Proxy,
            "ldap" => Self::Ldap,
            "ntlm" => Self::Ntlm,
            "teams" => Self::Teams,
            "anonymous" => Self::Anonymous,
            other => {
                return Err(AccessError::InvalidConfig {
                    reason: format!("unknown auth method '{other}'"),
                });
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Platform configuration
// ---------------------------------------------------------------------------

/// Top-level `platform.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformConfig {
    pub auth: AuthSection,
    pub anonymous_auth: AnonymousAuthConfig,
    pub local_auth: MethodConfig,
    pub oidc_auth: MethodConfig,
    pub proxy_auth: MethodConfig,
    pub ldap_auth: MethodConfig,
    pub ntlm_auth: MethodConfig,
    pub teams_auth: MethodConfig,
    pub jwt: JwtSettings,
    pub oauth: OAuthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSection {
    pub mode: AuthMethod,
    /// Group every authenticated principal joins automatically.
    pub authenticated_group: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            mode: AuthMethod::Local,
            authenticated_group: "authenticated".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnonymousAuthConfig {
    pub enabled: bool,
    pub default_groups: Vec<String>,
}

impl Default for AnonymousAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_groups: vec!["anonymous".into()],
        }
    }
}

/// Settings shared by every external auth method block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MethodConfig {
    pub enabled: bool,
    /// `None` defers to the method default (see [`AuthMethod::trusts_perimeter`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_self_signup: Option<bool>,
    pub default_groups: Vec<String>,
    /// Method-local external group name → internal group ids.
    pub group_mappings: BTreeMap<String, Vec<String>>,
    pub providers: Vec<ProviderConfig>,
}

/// A named identity provider inside a method block (e.g. one OIDC tenant).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub name: String,
    pub default_groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_self_signup: Option<bool>,
}

impl MethodConfig {
    fn provider(&self, name: Option<&str>) -> Option<&ProviderConfig> {
        let name = name?;
        self.providers.iter().find(|p| p.name == name)
    }
}

impl PlatformConfig {
    /// Parse and validate `platform.json` text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| AccessError::InvalidConfig {
            reason: format!("platform.json: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject token lifetimes and retention periods outside the supported
    /// range.
    pub fn validate(&self) -> Result<()> {
        check_range(
            "jwt.expiresInMinutes",
            self.jwt.expires_in_minutes,
            MAX_TOKEN_LIFETIME_MINUTES,
        )?;
        check_range(
            "oauth.defaultTokenExpirationMinutes",
            self.oauth.default_token_expiration_minutes,
            MAX_TOKEN_LIFETIME_MINUTES,
        )?;
        check_range(
            "oauth.refreshTokenTtlDays",
            self.oauth.refresh_token_ttl_days,
            MAX_TTL_DAYS,
        )?;
        check_range("oauth.consentTtlDays", self.oauth.consent_ttl_days, MAX_TTL_DAYS)
    }

    /// The configuration block for `method`; anonymous has none.
    pub fn method(&self, method: AuthMethod) -> Option<&MethodConfig> {
        match method {
            AuthMethod::Local => Some(&self.local_auth),
            AuthMethod::Oidc => Some(&self.oidc_auth),
            AuthMethod::Proxy => Some(&self.proxy_auth),
            AuthMethod::Ldap => Some(&self.ldap_auth),
            AuthMethod::Ntlm => Some(&self.ntlm_auth),
            AuthMethod::Teams => Some(&self.teams_auth),
            AuthMethod::Anonymous => None,
        }
    }

    /// Whether a new user may be created on first login via `method`.
    ///
    /// A provider-level setting wins over the method-level one, which wins
    /// over the method default.
    pub fn allow_self_signup(&self, method: AuthMethod, provider: Option<&str>) -> bool {
        let Some(block) = self.method(method) else {
            return false;
        };
        block
            .provider(provider)
            .and_then(|p| p.allow_self_signup)
            .or(block.allow_self_signup)
            .unwrap_or_else(|| method.trusts_perimeter())
    }

    /// Groups granted automatically at login: method defaults plus the
    /// matching provider's defaults.
    pub fn default_groups(&self, method: AuthMethod, provider: Option<&str>) -> Vec<String> {
        let Some(block) = self.method(method) else {
            return self.anonymous_auth.default_groups.clone();
        };
        let mut groups = block.default_groups.clone();
        if let Some(p) = block.provider(provider) {
            groups.extend(p.default_groups.iter().cloned());
        }
        groups
    }

    /// Every enabled method whose users are not persisted.
    pub fn config_derived_methods(&self) -> impl Iterator<Item = (AuthMethod, &MethodConfig)> {
        [AuthMethod::Ldap, AuthMethod::Ntlm]
            .into_iter()
            .filter_map(|m| self.method(m).map(|c| (m, c)))
            .filter(|(_, c)| c.enabled)
    }
}

// ---------------------------------------------------------------------------
// JWT and OAuth settings
// ---------------------------------------------------------------------------

/// Longest access token or session token lifetime, one year.
pub const MAX_TOKEN_LIFETIME_MINUTES: i64 = 366 * 24 * 60;

/// Longest refresh token, consent or static API key lifetime.
pub const MAX_TTL_DAYS: i64 = 10 * 366;

fn check_range(field: &str, value: i64, max: i64) -> Result<()> {
    if (1..=max).contains(&value) {
        Ok(())
    } else {
        Err(AccessError::InvalidConfig {
            reason: format!("platform.json: {field} must be between 1 and {max}, got {value}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JwtAlgorithm {
    #[default]
    HS256,
    RS256,
}

impl fmt::Display for JwtAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HS256 => f.write_str("HS256"),
            Self::RS256 => f.write_str("RS256"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JwtSettings {
    pub algorithm: JwtAlgorithm,
    /// HS256 secret. A `${VAR}` placeholder counts as unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub expires_in_minutes: i64,
    /// RS256 private key PEM (or a path to one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            algorithm: JwtAlgorithm::HS256,
            secret: None,
            issuer: "ai-hub-apps".into(),
            audience: "ai-hub-apps".into(),
            expires_in_minutes: 8 * 60,
            private_key: None,
            public_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OAuthSettings {
    pub enabled: bool,
    pub clients_file: String,
    pub authorization_code_enabled: bool,
    pub default_token_expiration_minutes: i64,
    pub refresh_token_ttl_days: i64,
    pub consent_ttl_days: i64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            clients_file: "oauth-clients.json".into(),
            authorization_code_enabled: true,
            default_token_expiration_minutes: 60,
            refresh_token_ttl_days: 30,
            consent_ttl_days: 90,
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog entries
// ---------------------------------------------------------------------------

/// One entry of `models.json` or `apps.json`. Only the fields access control
/// needs are typed; everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn enabled_by_default() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Configuration cache
// ---------------------------------------------------------------------------

/// Read access to the loaded configuration documents.
pub trait ConfigCache: Send + Sync {
    fn platform(&self) -> Arc<PlatformConfig>;
    fn groups(&self) -> Arc<GroupsDocument>;
    fn models(&self) -> Arc<Vec<CatalogEntry>>;
    fn apps(&self) -> Arc<Vec<CatalogEntry>>;
}

#[derive(Default)]
struct Snapshot {
    platform: Arc<PlatformConfig>,
    groups: Arc<GroupsDocument>,
    models: Arc<Vec<CatalogEntry>>,
    apps: Arc<Vec<CatalogEntry>>,
}

/// A [`ConfigCache`] over JSON files in a contents directory:
/// `platform.json`, `groups.json`, `models.json`, `apps.json`.
///
/// Owns the [`GroupPermissionResolver`] for the loaded groups so that a
/// reload swaps both together, or neither.
pub struct FileConfigCache {
    dir: PathBuf,
    snapshot: RwLock<Snapshot>,
    resolver: Arc<GroupPermissionResolver>,
}

impl FileConfigCache {
    /// Load every document from `dir`. Missing files fall back to defaults;
    /// a broken group graph is fatal.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let snapshot = read_snapshot(&dir).await?;
        let resolver = Arc::new(GroupPermissionResolver::new(&snapshot.groups)?);
        info!(
            dir = %dir.display(),
            mode = %snapshot.platform.auth.mode,
            models = snapshot.models.len(),
            apps = snapshot.apps.len(),
            "configuration loaded"
        );
        Ok(Self {
            dir,
            snapshot: RwLock::new(snapshot),
            resolver,
        })
    }

    /// Re-read every document. On any error the previous configuration and
    /// group resolution stay active.
    pub async fn reload(&self) -> Result<()> {
        let fresh = read_snapshot(&self.dir).await?;
        self.resolver.reload(&fresh.groups)?;
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        debug!(dir = %self.dir.display(), "configuration reloaded");
        Ok(())
    }

    pub fn resolver(&self) -> Arc<GroupPermissionResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T>(&self, pick: impl FnOnce(&Snapshot) -> Arc<T>) -> Arc<T> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        pick(&guard)
    }
}

impl ConfigCache for FileConfigCache {
    fn platform(&self) -> Arc<PlatformConfig> {
        self.read(|s| Arc::clone(&s.platform))
    }

    fn groups(&self) -> Arc<GroupsDocument> {
        self.read(|s| Arc::clone(&s.groups))
    }

    fn models(&self) -> Arc<Vec<CatalogEntry>> {
        self.read(|s| Arc::clone(&s.models))
    }

    fn apps(&self) -> Arc<Vec<CatalogEntry>> {
        self.read(|s| Arc::clone(&s.apps))
    }
}

/// In-memory [`ConfigCache`], for embedding and tests.
#[derive(Default)]
pub struct StaticConfig {
    snapshot: Snapshot,
}

impl StaticConfig {
    pub fn new(platform: PlatformConfig, groups: GroupsDocument) -> Self {
        Self {
            snapshot: Snapshot {
                platform: Arc::new(platform),
                groups: Arc::new(groups),
                ..Snapshot::default()
            },
        }
    }
}

impl ConfigCache for StaticConfig {
    fn platform(&self) -> Arc<PlatformConfig> {
        Arc::clone(&self.snapshot.platform)
    }

    fn groups(&self) -> Arc<GroupsDocument> {
        Arc::clone(&self.snapshot.groups)
    }

    fn models(&self) -> Arc<Vec<CatalogEntry>> {
        Arc::clone(&self.snapshot.models)
    }

    fn apps(&self) -> Arc<Vec<CatalogEntry>> {
        Arc::clone(&self.snapshot.apps)
    }
}

async fn read_snapshot(dir: &Path) -> Result<Snapshot> {
    let platform: PlatformConfig = load_document(dir, "platform.json").await?;
    platform.validate()?;
    let mut groups: GroupsDocument = load_document(dir, "groups.json").await?;
    groups.normalize();
    let models: Vec<CatalogEntry> = load_document(dir, "models.json").await?;
    let apps: Vec<CatalogEntry> = load_document(dir, "apps.json").await?;

    if platform.auth.mode != AuthMethod::Anonymous
        && platform.method(platform.auth.mode).is_some_and(|m| !m.enabled)
    {
        warn!(mode = %platform.auth.mode, "auth mode is set but its method block is disabled");
    }

    Ok(Snapshot {
        platform: Arc::new(platform),
        groups: Arc::new(groups),
        models: Arc::new(models),
        apps: Arc::new(apps),
    })
}

async fn load_document<T>(dir: &Path, name: &str) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned + Default + Send + 'static,
{
    let file: JsonFile<T> = JsonFile::new(dir.join(name));
    file.load().await.map_err(|e| {
        warn!(file = name, err = %e, "failed to load configuration document");
        AccessError::InvalidConfig {
            reason: format!("{name}: {e}"),
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_any_fields() {
        let cfg = PlatformConfig::from_json("{}").unwrap();
        assert_eq!(cfg.auth.mode, AuthMethod::Local);
        assert_eq!(cfg.auth.authenticated_group, "authenticated");
        assert_eq!(cfg.jwt.algorithm, JwtAlgorithm::HS256);
        assert_eq!(cfg.jwt.expires_in_minutes, 480);
        assert_eq!(cfg.oauth.refresh_token_ttl_days, 30);
        assert_eq!(cfg.oauth.consent_ttl_days, 90);
    }

    #[test]
    fn out_of_range_lifetimes_are_rejected() {
        for text in [
            r#"{ "jwt": { "expiresInMinutes": 0 } }"#,
            r#"{ "jwt": { "expiresInMinutes": 9223372036854775807 } }"#,
            r#"{ "oauth": { "defaultTokenExpirationMinutes": -5 } }"#,
            r#"{ "oauth": { "refreshTokenTtlDays": 100000000000 } }"#,
            r#"{ "oauth": { "consentTtlDays": 0 } }"#,
        ] {
            let err = PlatformConfig::from_json(text).unwrap_err();
            assert!(matches!(err, AccessError::InvalidConfig { .. }), "{text}");
        }

        let year = format!(r#"{{ "jwt": {{ "expiresInMinutes": {MAX_TOKEN_LIFETIME_MINUTES} }} }}"#);
        assert!(PlatformConfig::from_json(&year).is_ok());
    }

    #[test]
    fn self_signup_defaults_per_method() {
        let cfg = PlatformConfig::default();
        assert!(cfg.allow_self_signup(AuthMethod::Ntlm, None));
        assert!(cfg.allow_self_signup(AuthMethod::Proxy, None));
        assert!(!cfg.allow_self_signup(AuthMethod::Oidc, None));
        assert!(!cfg.allow_self_signup(AuthMethod::Anonymous, None));
    }

    #[test]
    fn provider_setting_overrides_method() {
        let cfg = PlatformConfig::from_json(
            r#"{ "oidcAuth": { "enabled": true, "allowSelfSignup": false, "defaultGroups": ["users"],
                 "providers": [{ "name": "entra", "allowSelfSignup": true, "defaultGroups": ["staff"] }] } }"#,
        )
        .unwrap();
        assert!(cfg.allow_self_signup(AuthMethod::Oidc, Some("entra")));
        assert!(!cfg.allow_self_signup(AuthMethod::Oidc, Some("google")));
        assert_eq!(
            cfg.default_groups(AuthMethod::Oidc, Some("entra")),
            vec!["users", "staff"]
        );
    }

    #[test]
    fn rs256_parses() {
        let cfg = PlatformConfig::from_json(r#"{ "jwt": { "algorithm": "RS256" } }"#).unwrap();
        assert_eq!(cfg.jwt.algorithm, JwtAlgorithm::RS256);
        assert_eq!(cfg.jwt.issuer, "ai-hub-apps");
    }

    #[test]
    fn auth_method_round_trips_through_str() {
        let m: AuthMethod = "NTLM".parse().unwrap();
        assert_eq!(m, AuthMethod::Ntlm);
        assert_eq!(m.to_string(), "ntlm");
        assert!("kerberos".parse::<AuthMethod>().is_err());
    }

    #[tokio::test]
    async fn file_cache_loads_and_rejects_cyclic_reload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("groups.json"),
            r#"{ "groups": { "admins": { "permissions": { "adminAccess": true } } } }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("models.json"), r#"[{ "id": "gpt-4", "name": "GPT-4" }]"#)
            .unwrap();

        let cache = FileConfigCache::load(dir.path()).await.unwrap();
        assert_eq!(cache.models()[0].id, "gpt-4");
        assert!(cache.models()[0].enabled);
        assert!(cache.apps().is_empty());
        assert_eq!(cache.resolver().admin_groups(), vec!["admins"]);

        std::fs::write(
            dir.path().join("groups.json"),
            r#"{ "groups": { "a": { "inherits": ["b"] }, "b": { "inherits": ["a"] } } }"#,
        )
        .unwrap();
        assert!(matches!(
            cache.reload().await,
            Err(AccessError::ConfigurationCycle { .. })
        ));
        assert!(cache.groups().groups.contains_key("admins"));
        assert_eq!(cache.resolver().admin_groups(), vec!["admins"]);
    }
}
