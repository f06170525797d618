//! Bearer-token verification for the handshake path.
//!
//! Production tokens are HS256 JWTs carrying `id` and `email` claims,
//! capped at one hour of age regardless of their `exp`. Outside
//! production the gateway is permissive: a plain `id.email.name` token
//! is accepted verbatim and a missing token yields an anonymous
//! identity. Revocation is a marker key in the shared store, hashed so
//! arbitrary token sizes cannot blow up the keyspace.

use std::time::Duration;

use chrono::Utc;
use corelay_core::config::AppConfig;
use corelay_core::store::{SharedStore, StoreResult};
use corelay_core::user::UserSnapshot;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;

pub const TOKEN_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Verify a bearer token according to the configured environment.
pub fn authenticate_token(config: &AppConfig, token: Option<&str>) -> Result<UserSnapshot, AppError> {
    if config.environment.is_production() {
        let token = token.ok_or_else(|| AppError::auth_rejected("missing bearer token"))?;
        verify_token(&config.jwt_secret, token)
    } else {
        Ok(dev_identity(token))
    }
}

pub fn verify_token(secret: &str, token: &str) -> Result<UserSnapshot, AppError> {
    verify_token_at(secret, token, Utc::now().timestamp())
}

fn verify_token_at(secret: &str, token: &str, now: i64) -> Result<UserSnapshot, AppError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|err| AppError::auth_rejected(format!("invalid token: {err}")))?;

    let claims = data.claims;
    if claims.id.trim().is_empty() || claims.email.trim().is_empty() {
        return Err(AppError::auth_rejected("token missing id or email claim"));
    }

    let age = now - claims.iat;
    if age > TOKEN_MAX_AGE.as_secs() as i64 {
        return Err(AppError::auth_rejected("token exceeds maximum age"));
    }

    Ok(UserSnapshot {
        name: claims.name.unwrap_or_else(|| display_name(&claims.email)),
        id: claims.id,
        email: claims.email,
        image: None,
    })
}

/// Permissive identity used outside production: `id.email.name` tokens
/// are taken at face value, anything else becomes an anonymous guest.
pub fn dev_identity(token: Option<&str>) -> UserSnapshot {
    if let Some(token) = token {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() == 3 && !segments[0].is_empty() && !segments[1].is_empty() {
            return UserSnapshot {
                id: segments[0].to_owned(),
                email: segments[1].to_owned(),
                name: if segments[2].is_empty() {
                    display_name(segments[1])
                } else {
                    segments[2].to_owned()
                },
                image: None,
            };
        }
    }

    let id = Uuid::new_v4().simple().to_string();
    UserSnapshot {
        email: format!("guest-{id}@local"),
        name: "Guest".to_owned(),
        id: format!("guest-{id}"),
        image: None,
    }
}

pub fn blacklist_key(token: &str) -> String {
    let digest = hex::encode(Sha256::digest(token.as_bytes()));
    format!("blacklist:{digest}")
}

/// Check the revocation marker. Store failures fail open so an outage
/// cannot lock every client out; the dropped lookup is counted.
pub async fn is_revoked(store: &SharedStore, token: &str) -> bool {
    match store.get_bypass_cache(&blacklist_key(token)).await {
        Ok(entry) => entry.is_some(),
        Err(err) => {
            warn!(error = %err, "revocation lookup failed; admitting");
            store.count_dropped_write();
            false
        }
    }
}

/// Revoke a token. The marker expires with the token itself when the
/// remaining lifetime is decodable, otherwise after `fallback_ttl`.
pub async fn blacklist(
    store: &SharedStore,
    secret: &str,
    token: &str,
    fallback_ttl: Duration,
) -> StoreResult<()> {
    let ttl = remaining_lifetime(secret, token).unwrap_or(fallback_ttl);
    store
        .set_with_ttl(&blacklist_key(token), &json!(true), ttl)
        .await
}

fn remaining_lifetime(secret: &str, token: &str) -> Option<Duration> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .ok()?;

    let remaining = data.claims.exp - Utc::now().timestamp();
    (remaining > 0).then(|| Duration::from_secs(remaining as u64))
}

fn display_name(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "unit-test-secret";

    fn make_token(claims: &Claims, algorithm: Algorithm) -> String {
        encode(
            &Header::new(algorithm),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn claims(iat: i64, exp: i64) -> Claims {
        Claims {
            id: "user-1".into(),
            email: "alice@example.com".into(),
            name: Some("Alice".into()),
            iat,
            exp,
        }
    }

    #[test]
    fn valid_token_yields_snapshot() {
        let now = Utc::now().timestamp();
        let token = make_token(&claims(now, now + 600), Algorithm::HS256);
        let user = verify_token_at(SECRET, &token, now).unwrap();
        assert_eq!(user.id, "user-1");
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.name, "Alice");
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = Utc::now().timestamp();
        let token = make_token(&claims(now - 7200, now - 3600), Algorithm::HS256);
        assert!(verify_token_at(SECRET, &token, now).is_err());
    }

    #[test]
    fn wrong_algorithm_is_rejected() {
        let now = Utc::now().timestamp();
        let token = make_token(&claims(now, now + 600), Algorithm::HS512);
        assert!(verify_token_at(SECRET, &token, now).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = Utc::now().timestamp();
        let token = make_token(&claims(now, now + 600), Algorithm::HS256);
        assert!(verify_token_at("other-secret", &token, now).is_err());
    }

    #[test]
    fn over_age_token_is_rejected_even_when_unexpired() {
        let now = Utc::now().timestamp();
        let token = make_token(&claims(now - 3601, now + 600), Algorithm::HS256);
        let err = verify_token_at(SECRET, &token, now).unwrap_err();
        assert_eq!(err.to_string(), "token exceeds maximum age");
    }

    #[test]
    fn token_without_email_claim_is_rejected() {
        #[derive(Serialize)]
        struct Partial {
            id: String,
            iat: i64,
            exp: i64,
        }
        let now = Utc::now().timestamp();
        let token = encode(
            &Header::default(),
            &Partial {
                id: "user-1".into(),
                iat: now,
                exp: now + 600,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(verify_token_at(SECRET, &token, now).is_err());
    }

    #[test]
    fn dev_identity_parses_dotted_tokens() {
        let user = dev_identity(Some("u1.bob@x.Bob"));
        assert_eq!(user.id, "u1");
        assert_eq!(user.email, "bob@x");
        assert_eq!(user.name, "Bob");
    }

    #[test]
    fn dev_identity_synthesizes_guests() {
        let user = dev_identity(None);
        assert!(user.id.starts_with("guest-"));
        assert!(user.email.ends_with("@local"));

        let malformed = dev_identity(Some("just-a-string"));
        assert!(malformed.id.starts_with("guest-"));
    }

    #[test]
    fn blacklist_key_is_a_bounded_digest() {
        let key = blacklist_key("some.very.long.token.value");
        assert!(key.starts_with("blacklist:"));
        assert_eq!(key.len(), "blacklist:".len() + 64);
        assert_eq!(key, blacklist_key("some.very.long.token.value"));
    }

    #[tokio::test]
    async fn revocation_check_fails_open_when_store_is_down() {
        let store = SharedStore::disabled();
        assert!(!is_revoked(&store, "token").await);
        assert_eq!(store.dropped_writes(), 1);
    }
}
