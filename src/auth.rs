//! Identity boundary. Tokens are issued by the authentication service; this
//! module only verifies them and turns the claims into a typed [`Identity`].

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::AppState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization token required")]
    Missing,

    #[error("invalid authorization token")]
    Invalid,

    #[error("endpoint requires the {0} role")]
    WrongRole(Role),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requester,
    Operator,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Requester => f.write_str("requester"),
            Role::Operator => f.write_str("operator"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub party_id: String,
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn require(&self, role: Role) -> Result<&Self, AuthError> {
        if self.role == role {
            Ok(self)
        } else {
            Err(AuthError::WrongRole(role))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: String,
    pub role: Role,
    pub exp: u64,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn hs256(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256];
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                tracing::debug!(error = %err, "token rejected");
                AuthError::Invalid
            })?;

        if claims.sub.trim().is_empty() {
            return Err(AuthError::Invalid);
        }

        Ok(Identity {
            party_id: claims.sub,
            name: claims.name,
            role: claims.role,
        })
    }
}

/// Caller identity resolved from `Authorization: Bearer <token>`.
pub struct AuthenticatedParty(pub Identity);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedParty {
    type Rejection = crate::error::AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::Missing)?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::Missing)?;

        let identity = state.authenticator.authenticate(token)?;
        Ok(Self(identity))
    }
}
