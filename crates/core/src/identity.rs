//! Identity Provider
//!
//! Validates the credential presented at handshake time and resolves it into
//! an [`Identity`]. The server never spawns connection tasks for a credential
//! that fails here.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

/// The identity record attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("missing credential")]
    Missing,
    #[error("credential expired")]
    Expired,
    #[error("invalid credential: {0}")]
    Invalid(String),
}

/// Resolves a raw handshake credential into an identity.
pub trait IdentityProvider: Send + Sync {
    fn validate(&self, credential: &str) -> Result<Identity, IdentityError>;
}

/// Claims carried by an access token. `sub` is the user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// An [`IdentityProvider`] backed by HS256-signed JWTs.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn validate(&self, credential: &str) -> Result<Identity, IdentityError> {
        let token = credential.trim();
        if token.is_empty() {
            return Err(IdentityError::Missing);
        }

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => IdentityError::Expired,
                _ => IdentityError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(IdentityError::Invalid("empty subject".to_string()));
        }

        Ok(Identity {
            user_id: data.claims.sub,
        })
    }
}
