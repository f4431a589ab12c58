//! HS256 bearer tokens.
//!
//! [`JwtAuthority`] verifies the short-lived tokens presented in AUTH frames
//! and REST `Authorization` headers, and can mint them for tests and tooling.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use rollcall_core::enrollment::Role;
use rollcall_core::errors::AuthError;
use rollcall_core::ids::UserId;
use rollcall_core::traits::{Identity, TokenVerifier};

use crate::error::ServerError;

/// Claims carried by a rollcall token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: UserId,
    /// Role granted.
    pub role: Role,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
    /// Issued at (Unix timestamp).
    pub iat: i64,
}

/// Signs and verifies tokens with a shared secret.
#[derive(Clone)]
pub struct JwtAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthority {
    /// Build an authority over `secret`.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token for `user` valid for `ttl`.
    pub fn issue(&self, user: &UserId, role: Role, ttl: Duration) -> Result<String, ServerError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.issue_until(user, role, expires_at)
    }

    /// Mint a token for `user` that expires at `expires_at`.
    pub fn issue_until(
        &self,
        user: &UserId,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ServerError> {
        let claims = Claims {
            sub: user.clone(),
            role,
            exp: expires_at.timestamp(),
            iat: Utc::now().timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Decode and validate `token`.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "token rejected");
                match e.kind() {
                    ErrorKind::ExpiredSignature => AuthError::Expired,
                    _ => AuthError::InvalidToken(e.to_string()),
                }
            })
    }
}

#[async_trait]
impl TokenVerifier for JwtAuthority {
    async fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.verify(token)?;
        Ok(Identity {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

/// Check that an AUTH frame's claimed identity matches the verified one.
pub fn ensure_matches(
    verified: &Identity,
    claimed_user: &UserId,
    claimed_role: Role,
) -> Result<(), AuthError> {
    if &verified.user_id == claimed_user && verified.role == claimed_role {
        Ok(())
    } else {
        Err(AuthError::IdentityMismatch {
            claimed_user: claimed_user.clone(),
            claimed_role,
        })
    }
}
