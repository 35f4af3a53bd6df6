//! JWT signing material.
//!
//! Resolution order, per key:
//!
//! 1. environment (`JWT_SECRET`, `JWT_PRIVATE_KEY`, `JWT_PUBLIC_KEY`)
//! 2. the `jwt` block of `platform.json`, unless the value is an
//!    unexpanded `${VAR}` placeholder
//! 3. a fallback generated once and persisted under the data directory
//!    with owner-only permissions
//!
//! PEM values may be given inline (literal `\n` escapes are accepted) or as
//! a path to a PEM file.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hub_access::{JwtAlgorithm, JwtSettings};
use hub_store::write_private;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::{random_hex, sha256_hex};
use crate::error::{AuthError, Result};

pub const ENV_SECRET: &str = "JWT_SECRET";
pub const ENV_PRIVATE_KEY: &str = "JWT_PRIVATE_KEY";
pub const ENV_PUBLIC_KEY: &str = "JWT_PUBLIC_KEY";

const SECRET_FILE: &str = ".jwt-secret";
const PRIVATE_KEY_FILE: &str = ".jwt-private.pem";
const PUBLIC_KEY_FILE: &str = ".jwt-public.pem";

/// RSA modulus size for generated keypairs.
pub const RSA_BITS: usize = 2048;

/// Shortest HS256 secret accepted without a warning.
const MIN_SECRET_LEN: usize = 32;

/// Where the active key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Environment,
    Config,
    /// Read back from a fallback written by an earlier run.
    Persisted(PathBuf),
    /// Generated by this run and written to disk.
    Generated(PathBuf),
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Environment => f.write_str("environment"),
            Self::Config => f.write_str("platform config"),
            Self::Persisted(p) => write!(f, "persisted fallback ({})", p.display()),
            Self::Generated(p) => write!(f, "generated fallback ({})", p.display()),
        }
    }
}

/// One entry of a JSON Web Key Set (RFC 7517).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Resolved keys for the configured algorithm.
pub struct SigningKeys {
    algorithm: JwtAlgorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Option<Jwk>,
    source: KeySource,
}

impl fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeys")
            .field("algorithm", &self.algorithm)
            .field("kid", &self.kid())
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl SigningKeys {
    /// HS256 keys from a shared secret.
    pub fn from_secret(secret: &[u8], source: KeySource) -> Self {
        Self {
            algorithm: JwtAlgorithm::HS256,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            jwk: None,
            source,
        }
    }

    /// RS256 keys from a PKCS#8 or PKCS#1 private key PEM. A supplied public
    /// key must belong to the private key.
    pub fn from_rsa_pem(
        private_pem: &str,
        public_pem: Option<&str>,
        source: KeySource,
    ) -> Result<Self> {
        let private = parse_private_key(private_pem)?;
        let derived = private.to_public_key();
        if let Some(pem) = public_pem
            && parse_public_key(pem)? != derived
        {
            return Err(AuthError::MissingSigningKey {
                reason: "configured public key does not match the private key".into(),
            });
        }

        let n = URL_SAFE_NO_PAD.encode(derived.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(derived.e().to_bytes_be());
        let kid = sha256_hex(&format!("{n}.{e}"))[..16].to_string();

        // Re-encode so PKCS#1 input reaches jsonwebtoken in a form it accepts.
        let pkcs8 = private.to_pkcs8_pem(LineEnding::LF).map_err(crypto)?;
        Ok(Self {
            algorithm: JwtAlgorithm::RS256,
            encoding: EncodingKey::from_rsa_pem(pkcs8.as_bytes())?,
            decoding: DecodingKey::from_rsa_components(&n, &e)?,
            jwk: Some(Jwk {
                kty: "RSA".into(),
                kid,
                alg: "RS256".into(),
                key_use: "sig".into(),
                n,
                e,
            }),
            source,
        })
    }

    pub fn algorithm(&self) -> JwtAlgorithm {
        self.algorithm
    }

    pub fn jwt_algorithm(&self) -> Algorithm {
        match self.algorithm {
            JwtAlgorithm::HS256 => Algorithm::HS256,
            JwtAlgorithm::RS256 => Algorithm::RS256,
        }
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// Key id placed in token headers; RS256 only.
    pub fn kid(&self) -> Option<&str> {
        self.jwk.as_ref().map(|k| k.kid.as_str())
    }

    pub fn source(&self) -> &KeySource {
        &self.source
    }

    /// Public keys for verifiers. Empty for HS256.
    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: self.jwk.iter().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Whether `value` is an unexpanded `${VAR}` template.
pub fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    v.starts_with("${") && v.ends_with('}')
}

/// Resolve keys for `settings` from the process environment, the config,
/// or a fallback under `data_dir`. Runs on the blocking pool since RSA key
/// generation takes a while.
pub async fn resolve_signing_keys(settings: &JwtSettings, data_dir: &Path) -> Result<SigningKeys> {
    let settings = settings.clone();
    let data_dir = data_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        resolve_with(&settings, &data_dir, &|name: &str| std::env::var(name).ok())
    })
    .await?
}

/// [`resolve_signing_keys`] with an injectable environment lookup.
pub fn resolve_with(
    settings: &JwtSettings,
    data_dir: &Path,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<SigningKeys> {
    let keys = match settings.algorithm {
        JwtAlgorithm::HS256 => resolve_hmac(settings, data_dir, env)?,
        JwtAlgorithm::RS256 => resolve_rsa(settings, data_dir, env)?,
    };
    info!(algorithm = %keys.algorithm, source = %keys.source, "jwt signing keys resolved");
    Ok(keys)
}

fn pick(
    var: &str,
    configured: Option<&str>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<(String, KeySource)> {
    if let Some(value) = env(var).filter(|v| !v.trim().is_empty()) {
        if !is_placeholder(&value) {
            return Some((value, KeySource::Environment));
        }
        warn!(var, "environment value is an unexpanded placeholder; ignoring");
    }
    let value = configured.filter(|v| !v.trim().is_empty())?;
    if is_placeholder(value) {
        warn!(var, "config value is an unexpanded placeholder; ignoring");
        return None;
    }
    Some((value.to_string(), KeySource::Config))
}

fn resolve_hmac(
    settings: &JwtSettings,
    data_dir: &Path,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<SigningKeys> {
    if let Some((secret, source)) = pick(ENV_SECRET, settings.secret.as_deref(), env) {
        if secret.len() < MIN_SECRET_LEN {
            warn!(len = secret.len(), "jwt secret is shorter than 32 bytes");
        }
        return Ok(SigningKeys::from_secret(secret.as_bytes(), source));
    }

    let path = data_dir.join(SECRET_FILE);
    if let Some(secret) = read_optional(&path)? {
        return Ok(SigningKeys::from_secret(secret.trim().as_bytes(), KeySource::Persisted(path)));
    }

    let secret = random_hex(64)?;
    write_private(&path, secret.as_bytes())?;
    warn!(path = %path.display(), "no jwt secret configured; generated a fallback");
    Ok(SigningKeys::from_secret(secret.as_bytes(), KeySource::Generated(path)))
}

fn resolve_rsa(
    settings: &JwtSettings,
    data_dir: &Path,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<SigningKeys> {
    let private = pick(ENV_PRIVATE_KEY, settings.private_key.as_deref(), env);
    let public = pick(ENV_PUBLIC_KEY, settings.public_key.as_deref(), env);

    match (private, public) {
        (Some((private, source)), public) => {
            let private = read_pem(&private)?;
            let public = public.map(|(p, _)| read_pem(&p)).transpose()?;
            SigningKeys::from_rsa_pem(&private, public.as_deref(), source)
        }
        (None, Some(_)) => Err(AuthError::MissingSigningKey {
            reason: "an RS256 public key is configured without its private key".into(),
        }),
        (None, None) => {
            let private_path = data_dir.join(PRIVATE_KEY_FILE);
            if let Some(pem) = read_optional(&private_path)? {
                return SigningKeys::from_rsa_pem(&pem, None, KeySource::Persisted(private_path));
            }

            let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS).map_err(crypto)?;
            let private_pem = key.to_pkcs8_pem(LineEnding::LF).map_err(crypto)?;
            let public_pem = key
                .to_public_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(crypto)?;
            write_private(&private_path, private_pem.as_bytes())?;
            write_private(&data_dir.join(PUBLIC_KEY_FILE), public_pem.as_bytes())?;
            warn!(path = %private_path.display(), "no RS256 key configured; generated a fallback keypair");
            SigningKeys::from_rsa_pem(&private_pem, None, KeySource::Generated(private_path))
        }
    }
}

fn crypto(err: impl fmt::Display) -> AuthError {
    AuthError::Crypto {
        reason: err.to_string(),
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Ok(Some(text)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AuthError::MissingSigningKey {
            reason: format!("cannot read {}: {e}", path.display()),
        }),
    }
}

/// Inline PEM or a path to one.
fn read_pem(value: &str) -> Result<String> {
    let value = value.replace("\\n", "\n");
    if value.contains("-----BEGIN") {
        return Ok(value);
    }
    let path = Path::new(value.trim());
    read_optional(path)?.ok_or_else(|| AuthError::MissingSigningKey {
        reason: format!("key file {} is missing or empty", path.display()),
    })
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AuthError::MissingSigningKey {
            reason: format!("unreadable RS256 private key: {e}"),
        })
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AuthError::MissingSigningKey {
            reason: format!("unreadable RS256 public key: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use jsonwebtoken::{Header, Validation};

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe {
        sub: String,
        exp: i64,
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    /// Whether a token signed by `a` verifies under `b`.
    fn interoperable(a: &SigningKeys, b: &SigningKeys) -> bool {
        let probe = Probe {
            sub: "probe".into(),
            exp: chrono::Utc::now().timestamp() + 60,
        };
        let mut header = Header::new(a.jwt_algorithm());
        header.kid = a.kid().map(str::to_string);
        let token = jsonwebtoken::encode(&header, &probe, a.encoding_key()).unwrap();
        let mut validation = Validation::new(b.jwt_algorithm());
        validation.validate_aud = false;
        jsonwebtoken::decode::<Probe>(&token, b.decoding_key(), &validation).is_ok()
    }

    fn settings(algorithm: JwtAlgorithm) -> JwtSettings {
        JwtSettings {
            algorithm,
            ..Default::default()
        }
    }

    #[test]
    fn placeholder_detection() {
        assert!(is_placeholder("${JWT_SECRET}"));
        assert!(is_placeholder("  ${X} "));
        assert!(!is_placeholder("plain-secret"));
        assert!(!is_placeholder("${unterminated"));
    }

    #[test]
    fn environment_beats_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(JwtAlgorithm::HS256);
        s.secret = Some("c".repeat(40));
        let secret = "e".repeat(40);
        let env = env_of(&[(ENV_SECRET, secret.as_str())]);

        let keys = resolve_with(&s, dir.path(), &env).unwrap();
        assert_eq!(keys.source(), &KeySource::Environment);
        let from_env = SigningKeys::from_secret(secret.as_bytes(), KeySource::Environment);
        assert!(interoperable(&keys, &from_env));
    }

    #[test]
    fn placeholder_config_falls_back_to_generated_secret() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(JwtAlgorithm::HS256);
        s.secret = Some("${JWT_SECRET}".into());
        let env = env_of(&[]);

        let first = resolve_with(&s, dir.path(), &env).unwrap();
        assert!(matches!(first.source(), KeySource::Generated(_)));
        let second = resolve_with(&s, dir.path(), &env).unwrap();
        assert!(matches!(second.source(), KeySource::Persisted(_)));
        assert!(interoperable(&first, &second));

        let placeholder = SigningKeys::from_secret(b"${JWT_SECRET}", KeySource::Config);
        assert!(!interoperable(&placeholder, &second));
    }

    #[cfg(unix)]
    #[test]
    fn generated_secret_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        resolve_with(&settings(JwtAlgorithm::HS256), dir.path(), &env_of(&[])).unwrap();
        let mode = std::fs::metadata(dir.path().join(SECRET_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn rsa_fallback_is_generated_once_and_published() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(JwtAlgorithm::RS256);
        let env = env_of(&[]);

        let first = resolve_with(&s, dir.path(), &env).unwrap();
        assert!(matches!(first.source(), KeySource::Generated(_)));
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());

        let second = resolve_with(&s, dir.path(), &env).unwrap();
        assert!(matches!(second.source(), KeySource::Persisted(_)));
        assert!(interoperable(&first, &second));

        let jwks = second.jwks();
        assert_eq!(jwks.keys.len(), 1);
        let jwk = &jwks.keys[0];
        assert_eq!((jwk.kty.as_str(), jwk.alg.as_str(), jwk.key_use.as_str()), ("RSA", "RS256", "sig"));
        assert_eq!(jwk.e, "AQAB");
        assert_eq!(Some(jwk.kid.as_str()), first.kid());

        // Mismatched public key.
        let other = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS).unwrap();
        let other_pub = other.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();
        let private = std::fs::read_to_string(dir.path().join(PRIVATE_KEY_FILE)).unwrap();
        let err = SigningKeys::from_rsa_pem(&private, Some(&other_pub), KeySource::Config).unwrap_err();
        assert!(matches!(err, AuthError::MissingSigningKey { .. }));
    }

    #[test]
    fn public_key_alone_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_of(&[(ENV_PUBLIC_KEY, "-----BEGIN PUBLIC KEY-----\n...")]);
        let err = resolve_with(&settings(JwtAlgorithm::RS256), dir.path(), &env).unwrap_err();
        assert!(matches!(err, AuthError::MissingSigningKey { .. }));
    }

    #[test]
    fn hmac_publishes_no_keys() {
        let keys = SigningKeys::from_secret(b"0123456789abcdef0123456789abcdef", KeySource::Config);
        assert!(keys.jwks().keys.is_empty());
        assert!(keys.kid().is_none());
    }
}
