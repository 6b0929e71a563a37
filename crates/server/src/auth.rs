//! Thin bearer-token authentication. Identity management proper is a
//! collaborator subsystem; this layer exists so ownership checks and
//! 401/403 semantics are real. Passwords and tokens are stored as salted
//! SHA-256 digests; tokens are opaque and expire per configuration.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::users::UserRecord;
use crate::db::StoreError;
use crate::error::ApiError;
use crate::state::AppState;

pub fn generate_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn generate_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

/// Tokens are stored hashed so a database leak does not leak sessions.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Extractor resolving the `Authorization: Bearer …` header to the owning
/// user.
pub struct AuthUser(pub UserRecord);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let token = header.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;

        match state.db.user_for_token(&hash_token(token)) {
            Ok(user) => Ok(AuthUser(user)),
            Err(StoreError::NotFound) => Err(ApiError::Unauthorized),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_depends_on_salt() {
        let a = hash_password("secret", "salt-a");
        let b = hash_password("secret", "salt-b");
        assert_ne!(a, b);
        assert_eq!(a, hash_password("secret", "salt-a"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_token_hash_stable() {
        let token = generate_token();
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
    }

    #[test]
    fn test_generated_tokens_unique() {
        assert_ne!(generate_token(), generate_token());
        assert_ne!(generate_salt(), generate_salt());
    }
}
