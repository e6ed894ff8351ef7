use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::{api::ApiState, resources::identity::Identity};

/// The authenticated caller, taken from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct ServiceRequestContext {
    pub identity: Identity,
}

/// Like [`ServiceRequestContext`], but only for admins.
#[derive(Debug, Clone)]
pub struct AdminRequestContext {
    pub identity: Identity,
}

pub enum ServiceRequestContextError {
    MissingToken,
    InvalidToken,
    Forbidden,
}

impl IntoResponse for ServiceRequestContextError {
    fn into_response(self) -> Response {
        match self {
            ServiceRequestContextError::MissingToken => {
                (StatusCode::UNAUTHORIZED, "Missing token").into_response()
            }
            ServiceRequestContextError::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "Invalid token").into_response()
            }
            ServiceRequestContextError::Forbidden => {
                (StatusCode::FORBIDDEN, "Admin only").into_response()
            }
        }
    }
}

impl FromRequestParts<Arc<ApiState>> for ServiceRequestContext {
    type Rejection = ServiceRequestContextError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return Err(ServiceRequestContextError::MissingToken);
        };

        let claims = state.auth_handler.verify_token(token.trim()).map_err(|e| {
            debug!("rejected token: {}", e);
            ServiceRequestContextError::InvalidToken
        })?;

        Ok(ServiceRequestContext {
            identity: claims.identity(),
        })
    }
}

impl FromRequestParts<Arc<ApiState>> for AdminRequestContext {
    type Rejection = ServiceRequestContextError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let ctx = ServiceRequestContext::from_request_parts(parts, state).await?;
        if !ctx.identity.is_admin {
            return Err(ServiceRequestContextError::Forbidden);
        }

        Ok(AdminRequestContext {
            identity: ctx.identity,
        })
    }
}
