//! Checked conversions from configured lifetimes to timestamps.
//!
//! Lifetimes arrive as plain integers from client records, requests and
//! `platform.json`. Anything outside `1..=MAX` is an `invalid_request`
//! instead of an overflow in `chrono`.

use chrono::{DateTime, Duration, Utc};
use hub_access::{MAX_TOKEN_LIFETIME_MINUTES, MAX_TTL_DAYS};

use crate::error::{AuthError, Result};

/// An access token lifetime of `minutes`.
pub fn token_minutes(minutes: i64) -> Result<Duration> {
    if !(1..=MAX_TOKEN_LIFETIME_MINUTES).contains(&minutes) {
        return Err(AuthError::request(format!(
            "token lifetime must be between 1 and {MAX_TOKEN_LIFETIME_MINUTES} minutes"
        )));
    }
    Duration::try_minutes(minutes).ok_or_else(|| AuthError::request("token lifetime overflows"))
}

/// A retention period of `days` for refresh tokens, consents and API keys.
pub fn ttl_days(days: i64) -> Result<Duration> {
    if !(1..=MAX_TTL_DAYS).contains(&days) {
        return Err(AuthError::request(format!(
            "lifetime must be between 1 and {MAX_TTL_DAYS} days"
        )));
    }
    Duration::try_days(days).ok_or_else(|| AuthError::request("lifetime overflows"))
}

/// `now + lifetime`.
pub fn expiry(now: DateTime<Utc>, lifetime: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(lifetime)
        .ok_or_else(|| AuthError::request("expiry is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_inclusive() {
        assert_eq!(token_minutes(1).unwrap(), Duration::minutes(1));
        assert!(token_minutes(MAX_TOKEN_LIFETIME_MINUTES).is_ok());
        assert!(ttl_days(MAX_TTL_DAYS).is_ok());
    }

    #[test]
    fn overflowing_values_are_invalid_requests() {
        for minutes in [0, -1, MAX_TOKEN_LIFETIME_MINUTES + 1, i64::MAX, i64::MIN] {
            let err = token_minutes(minutes).unwrap_err();
            assert_eq!(err.oauth_error_code(), "invalid_request");
        }
        for days in [0, MAX_TTL_DAYS + 1, i64::MAX] {
            assert!(matches!(ttl_days(days), Err(AuthError::InvalidRequest { .. })));
        }
    }

    #[test]
    fn expiry_near_the_end_of_time_fails() {
        let now = Utc::now();
        assert_eq!(expiry(now, Duration::hours(1)).unwrap(), now + Duration::hours(1));
        assert!(expiry(DateTime::<Utc>::MAX_UTC, Duration::minutes(1)).is_err());
    }
}
