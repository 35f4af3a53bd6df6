//! Proof Key for Code Exchange (RFC 7636).
//!
//! Only the `S256` method is supported. `plain` sends the verifier in the
//! clear on the authorization request and is rejected everywhere.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use subtle::ConstantTimeEq;

use crate::crypto::{TOKEN_BYTES, random_bytes, sha256};
use crate::error::Result;

/// The one supported challenge method.
pub const S256: &str = "S256";

/// Shortest verifier RFC 7636 allows.
pub const MIN_VERIFIER_LEN: usize = 43;

/// Longest verifier RFC 7636 allows.
pub const MAX_VERIFIER_LEN: usize = 128;

/// Generate a code verifier: 256 random bits, base64url encoded (43 chars).
///
/// # Errors
///
/// Returns an error if the system CSPRNG fails.
pub fn generate_code_verifier() -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(TOKEN_BYTES)?))
}

/// `BASE64URL(SHA256(ASCII(verifier)))`
pub fn generate_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(sha256(verifier.as_bytes()).as_ref())
}

/// Whether `method` is a challenge method this server accepts.
pub fn is_supported_method(method: &str) -> bool {
    method == S256
}

/// Whether `verifier` is 43 to 128 characters from the unreserved set.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Check `verifier` against the stored `challenge`.
///
/// Any method other than `S256` yields `false`. The comparison is constant
/// time; a length mismatch is simply `false`.
pub fn verify_code_challenge(verifier: &str, challenge: &str, method: &str) -> bool {
    if !is_supported_method(method) || !is_valid_verifier(verifier) {
        return false;
    }
    let computed = generate_code_challenge(verifier);
    if computed.len() != challenge.len() {
        return false;
    }
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
