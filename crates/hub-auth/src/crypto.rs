//! Randomness, digests, and password-style hashing.
//!
//! - **Random generation**: `ring`'s system CSPRNG for codes, refresh
//!   tokens, client secrets, and fallback signing secrets.
//! - **Digests**: SHA-256 hex for lookup keys that must not reveal the
//!   token they index.
//! - **bcrypt**: for secrets at rest (refresh tokens, client secrets). It is
//!   CPU-bound and always runs on the blocking pool.

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::warn;

use crate::error::{AuthError, Result};

/// bcrypt work factor for stored secrets.
pub const BCRYPT_COST: u32 = 10;

/// Size of codes, refresh tokens, and client secrets in bytes (256 bits).
pub const TOKEN_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Random generation
// ---------------------------------------------------------------------------

/// Fill a buffer of `len` bytes from the system CSPRNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes).map_err(|_| AuthError::Crypto {
        reason: "failed to generate random bytes".into(),
    })?;
    Ok(bytes)
}

/// `len` random bytes, lowercase hex encoded.
pub fn random_hex(len: usize) -> Result<String> {
    Ok(to_hex(&random_bytes(len)?))
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

pub fn sha256(input: &[u8]) -> digest::Digest {
    digest::digest(&digest::SHA256, input)
}

/// Hex SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    to_hex(sha256(input.as_bytes()).as_ref())
}

// ---------------------------------------------------------------------------
// bcrypt
// ---------------------------------------------------------------------------

/// Hash `secret` with bcrypt on the blocking pool.
pub async fn bcrypt_hash(secret: String) -> Result<String> {
    let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(secret, BCRYPT_COST)).await??;
    Ok(hashed)
}

/// Compare `secret` against a stored bcrypt hash on the blocking pool.
///
/// A malformed stored hash compares as `false`.
pub async fn bcrypt_verify(secret: String, hash: String) -> Result<bool> {
    let outcome = tokio::task::spawn_blocking(move || bcrypt::verify(secret, &hash)).await?;
    match outcome {
        Ok(matched) => Ok(matched),
        Err(err) => {
            warn!(%err, "stored bcrypt hash is malformed");
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_has_expected_length() {
        let a = random_hex(TOKEN_BYTES).unwrap();
        let b = random_hex(TOKEN_BYTES).unwrap();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn bcrypt_round_trip() {
        let hash = bcrypt_hash("s3cret".into()).await.unwrap();
        assert!(hash.starts_with("$2"));
        assert!(bcrypt_verify("s3cret".into(), hash.clone()).await.unwrap());
        assert!(!bcrypt_verify("wrong".into(), hash).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_hash_is_false() {
        assert!(!bcrypt_verify("x".into(), "not-a-hash".into()).await.unwrap());
    }
}
