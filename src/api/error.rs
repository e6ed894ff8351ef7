use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::error::RequestError;

pub fn status_code(error: &RequestError) -> StatusCode {
    match error {
        RequestError::Validation(_) => StatusCode::BAD_REQUEST,
        RequestError::Conflict(_) => StatusCode::CONFLICT,
        RequestError::NotFound => StatusCode::NOT_FOUND,
        RequestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        let message = match &self {
            RequestError::Internal(e) => {
                error!("request failed: {:#}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
