use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::resources::identity::Identity;

pub const DEFAULT_TOKEN_TTL_SECS: u64 = 60 * 60 * 24 * 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokenClaims {
    pub sub: String,
    pub admin: bool,
    pub name: String,
    #[serde(rename = "eid")]
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    iat: u64,
    exp: u64,
}

impl AuthTokenClaims {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.sub.clone(),
            is_admin: self.admin,
            display_name: self.name.clone(),
            external_id: self.external_id.clone(),
            email: self.email.clone(),
        }
    }
}

/// Issues and checks the bearer tokens that carry a caller's [`Identity`]. The secret is
/// base64 encoded.
pub struct AuthHandler {
    jwt_secret: String,
}

impl AuthHandler {
    pub fn new(jwt_secret: impl AsRef<str>) -> Self {
        Self {
            jwt_secret: jwt_secret.as_ref().to_string(),
        }
    }

    pub fn generate_token(&self, identity: &Identity, ttl_secs: u64) -> Result<String> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;

        let claims = AuthTokenClaims {
            sub: identity.user_id.clone(),
            admin: identity.is_admin,
            name: identity.display_name.clone(),
            external_id: identity.external_id.clone(),
            email: identity.email.clone(),
            iat: now.as_secs(),
            exp: now.as_secs() + ttl_secs,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_base64_secret(&self.jwt_secret)?,
        )?;

        Ok(token)
    }

    pub fn verify_token(&self, token: impl AsRef<str>) -> Result<AuthTokenClaims> {
        let token = token.as_ref();
        let decoded = decode::<AuthTokenClaims>(
            token,
            &DecodingKey::from_base64_secret(&self.jwt_secret)?,
            &Validation::default(),
        )?;

        Ok(decoded.claims)
    }
}
