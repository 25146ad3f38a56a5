use bcrypt::{hash, verify};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::time::Duration;

use crate::models::{Claims, User};

pub fn hash_password(password: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    hash(password, cost)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, bcrypt::BcryptError> {
    verify(password, hash)
}

/// Usernames are stored trimmed and lower-cased.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Issues and validates HS256 access tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            role: user.role,
            iat: now,
            exp: now + self.ttl.as_secs() as usize,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn validate(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let token_data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?;
        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserRole;

    fn user() -> User {
        User {
            id: 42,
            username: "ana".to_string(),
            email: None,
            password_hash: String::new(),
            role: UserRole::Tester,
            parent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn password_hash_roundtrip() {
        let hashed = hash_password("Noa2025!", 4).unwrap();
        assert!(verify_password("Noa2025!", &hashed).unwrap());
        assert!(!verify_password("wrong", &hashed).unwrap());
    }

    #[test]
    fn issued_token_validates_with_same_secret() {
        let issuer = TokenIssuer::new("secret", Duration::from_secs(3600));
        let token = issuer.issue(&user()).unwrap();
        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.user_id(), Some(42));
        assert_eq!(claims.username, "ana");
        assert_eq!(claims.role, UserRole::Tester);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let token = TokenIssuer::new("one", Duration::from_secs(60)).issue(&user()).unwrap();
        assert!(TokenIssuer::new("two", Duration::from_secs(60)).validate(&token).is_err());
    }

    #[test]
    fn usernames_are_normalized() {
        assert_eq!(normalize_username("  Tony "), "tony");
    }
}
