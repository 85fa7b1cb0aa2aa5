//! Player identity from bearer tokens
//!
//! Tokens are issued elsewhere (login is out of scope); this module only
//! verifies them and checks that the caller acts as themselves.
//!
//! - Tokens are signed with HS256
//! - Without a configured secret a fixed development secret is used

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProgressError;

/// Payload carried in a player token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub player_id: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// JWT validator and generator
#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
    expiry_seconds: u64,
}

impl JwtValidator {
    /// Returns an error if the secret is empty or shorter than 32 bytes
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self, ProgressError> {
        if secret.is_empty() {
            return Err(ProgressError::Validation("JWT secret must not be empty".into()));
        }
        if secret.len() < 32 {
            return Err(ProgressError::Validation(
                "JWT secret must be at least 32 characters".into(),
            ));
        }
        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    /// Validator for local development
    pub fn new_dev() -> Self {
        warn!("No JWT secret configured, using development secret");
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            expiry_seconds: 3600,
        }
    }

    /// Issue a token for `player_id`. Used by tests and local tooling.
    pub fn generate_token(&self, player_id: &str) -> Result<String, ProgressError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ProgressError::Internal(format!("System time error: {}", e)))?
            .as_secs();

        let claims = Claims {
            player_id: player_id.to_string(),
            iat: now,
            exp: now + self.expiry_seconds,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ProgressError::Internal(format!("Failed to generate token: {}", e)))
    }

    /// Verify signature and expiry
    pub fn verify_token(&self, token: &str) -> Result<Claims, ProgressError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|err| {
            use jsonwebtoken::errors::ErrorKind;
            let message = match err.kind() {
                ErrorKind::ExpiredSignature => "Token expired",
                ErrorKind::InvalidSignature => "Invalid signature",
                ErrorKind::InvalidToken => "Invalid token",
                _ => "Token validation failed",
            };
            ProgressError::Unauthorized(message.into())
        })
    }

    /// Claims from an `Authorization` header; a token is required
    pub fn authenticate(&self, header: Option<&str>) -> Result<Claims, ProgressError> {
        let token = extract_bearer(header)
            .ok_or_else(|| ProgressError::Unauthorized("Bearer token required".into()))?;
        self.verify_token(token)
    }

    /// Claims if a valid token is present; bad tokens are treated as anonymous
    pub fn authenticate_optional(&self, header: Option<&str>) -> Option<Claims> {
        let token = extract_bearer(header)?;
        match self.verify_token(token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                debug!(error = %e, "Ignoring invalid optional token");
                None
            }
        }
    }
}

/// The caller may only act on their own progress
pub fn authorize(claims: &Claims, player_id: &str) -> Result<(), ProgressError> {
    if claims.player_id != player_id {
        return Err(ProgressError::Forbidden(
            "Token does not belong to this player".into(),
        ));
    }
    Ok(())
}

/// Token from a `Bearer <token>` header value
pub fn extract_bearer(header: Option<&str>) -> Option<&str> {
    let token = header?.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
