//! Credential pair and claim decoding

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AuthError;

/// Access and refresh token issued together by the auth server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    /// Short-lived bearer token
    pub access_token: String,

    /// Long-lived token used only to mint new access tokens
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// A session is valid while its refresh token is, even if the access
    /// token already expired.
    pub fn is_session_valid(&self) -> bool {
        !is_expired(&self.refresh_token)
    }

    /// Subject of the access token, if it can be decoded.
    pub fn subject(&self) -> Option<String> {
        decode_claims(&self.access_token).ok().and_then(|c| c.sub)
    }
}

/// Claims this client reads from a token. The signature is not verified
/// here; the server does that on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

/// Decodes the payload of a JWT without checking its signature or expiry.
pub fn decode_claims(token: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|err| AuthError::TokenMalformed(err.to_string()))
}

/// Time left until the token expires. Malformed tokens count as expired.
pub fn time_to_expiry(token: &str) -> Duration {
    let claims = match decode_claims(token) {
        Ok(claims) => claims,
        Err(err) => {
            debug!("Treating undecodable token as expired: {}", err);
            return Duration::ZERO;
        }
    };

    let remaining = claims.exp - Utc::now().timestamp();
    if remaining <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(remaining as u64)
    }
}

pub fn is_expired(token: &str) -> bool {
    time_to_expiry(token).is_zero()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(sub: &str, ttl_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Some(sub.to_string()),
            exp: now + ttl_secs,
            iat: Some(now),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"unit-test-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_decode_claims_ignores_signature() {
        let token = mint("user-42", 600);
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("user-42"));
        assert!(claims.expires_at().is_some());
    }

    #[test]
    fn test_time_to_expiry_for_live_token() {
        let remaining = time_to_expiry(&mint("u", 240));
        assert!(remaining > Duration::from_secs(230));
        assert!(remaining <= Duration::from_secs(240));
    }

    #[test]
    fn test_expired_token_has_no_time_left() {
        assert_eq!(time_to_expiry(&mint("u", -30)), Duration::ZERO);
        assert!(is_expired(&mint("u", -30)));
    }

    #[test]
    fn test_malformed_token_fails_closed() {
        assert_eq!(time_to_expiry("not-a-jwt"), Duration::ZERO);
        assert_eq!(time_to_expiry(""), Duration::ZERO);
        assert!(matches!(
            decode_claims("a.b.c"),
            Err(AuthError::TokenMalformed(_))
        ));
    }

    #[test]
    fn test_session_validity_follows_refresh_token() {
        let pair = TokenPair::new(mint("u", -10), mint("u", 3600));
        assert!(pair.is_session_valid());
        assert_eq!(pair.subject().as_deref(), Some("u"));

        let ended = TokenPair::new(mint("u", 600), mint("u", -10));
        assert!(!ended.is_session_valid());
    }
}
