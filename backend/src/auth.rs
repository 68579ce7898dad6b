use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use gacha_core::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const TOKEN_TTL_SECS: i64 = 3600;
pub const MAX_FAILED_LOGINS: i64 = 6;
pub const LOCKOUT_MINS: i64 = 15;

/// HS256 claims carried by every access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub role: String,
    pub email: String,
    pub exp: i64,
}

pub fn jwt_secret() -> String {
    std::env::var("JWT_SECRET").unwrap_or_else(|_| "change-this-secret".to_string())
}

pub fn issue_token(
    user_id: UserId,
    email: &str,
    role: &str,
    secret: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        email: email.to_string(),
        exp: Utc::now().timestamp() + TOKEN_TTL_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

/// Argon2id hash in PHC string format; parameters and salt travel inside
/// the hash itself.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed = PasswordHash::new(hash)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e),
    }
}

/// A lock is active while `locked_until` parses to a future instant.
pub fn is_locked(locked_until: Option<&str>) -> bool {
    locked_until
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|until| until > Utc::now())
        .unwrap_or(false)
}

pub fn lockout_deadline() -> String {
    (Utc::now() + Duration::minutes(LOCKOUT_MINS)).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let hash = hash_password("correct-horse-battery-staple").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct-horse-battery-staple", &hash).unwrap());
        assert!(!verify_password("wrong-password", &hash).unwrap());
    }

    #[test]
    fn token_roundtrip_preserves_claims() {
        let token = issue_token(42, "a@example.com", "admin", "test-secret").unwrap();
        let claims = verify_token(&token, "test-secret").unwrap();
        assert_eq!(claims.sub, 42);
        assert_eq!(claims.email, "a@example.com");
        assert_eq!(claims.role, "admin");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn token_signed_with_other_secret_fails() {
        let token = issue_token(1, "a@example.com", "user", "secret-alpha").unwrap();
        assert!(verify_token(&token, "secret-bravo").is_err());
    }

    #[test]
    fn expired_token_fails() {
        // Expired well past the validator's default leeway.
        let claims = Claims {
            sub: 1,
            role: "user".into(),
            email: "a@example.com".into(),
            exp: Utc::now().timestamp() - 300,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(verify_token(&token, "test-secret").is_err());
    }

    #[test]
    fn lock_state_follows_deadline() {
        assert!(!is_locked(None));
        assert!(!is_locked(Some("2001-01-01T00:00:00+00:00")));
        assert!(!is_locked(Some("not a timestamp")));
        let deadline = lockout_deadline();
        assert!(is_locked(Some(deadline.as_str())));
    }
}
