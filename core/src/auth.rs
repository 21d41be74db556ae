//! HMAC-SHA256-signed bearer tokens with 24h expiry. Realized as HS256
//! JWTs via `jsonwebtoken` — an HS256 JWT *is* an HMAC-SHA256 MAC over a
//! compact, base64-encoded string.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{CcrError, Result};

const SUBJECT: &str = "ccr-client";
const EXPIRY_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Signs a fresh bearer token with the server's secret, expiring in 24h.
pub fn create_access_token(config: &Config) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: SUBJECT.to_string(),
        iat: now,
        exp: now + EXPIRY_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| CcrError::AuthFailed(e.to_string()))
}

/// Verifies signature and expiry. Returns `Ok(())` on a valid,
/// unexpired token; an `AuthFailed` error otherwise (bad signature,
/// expired, or malformed).
pub fn verify_access_token(token: &str, config: &Config) -> Result<()> {
    let mut validation = Validation::default();
    validation.set_required_spec_claims(&["exp", "sub"]);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|_| ())
    .map_err(|e| CcrError::AuthFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            port: 3100,
            host: "0.0.0.0".into(),
            jwt_secret: "test-secret-0123456789abcdef".into(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }

    #[test]
    fn round_trips() {
        let cfg = test_config();
        let token = create_access_token(&cfg).unwrap();
        assert!(verify_access_token(&token, &cfg).is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let cfg = test_config();
        let token = create_access_token(&cfg).unwrap();
        let mut other = test_config();
        other.jwt_secret = "a-different-secret".into();
        assert!(verify_access_token(&token, &other).is_err());
    }

    #[test]
    fn garbage_token_fails() {
        let cfg = test_config();
        assert!(verify_access_token("not.a.jwt", &cfg).is_err());
    }

    #[test]
    fn expired_token_fails() {
        let cfg = test_config();
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: SUBJECT.to_string(),
            iat: now - EXPIRY_SECS - 10,
            exp: now - 10,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        )
        .unwrap();
        assert!(verify_access_token(&token, &cfg).is_err());
    }
}
