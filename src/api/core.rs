use std::sync::Arc;

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::{
    ApiState,
    context::ServiceRequestContext,
    resource_service::{ResourceService, ResourceServiceRouter},
};

pub struct CoreService {}

impl ResourceService for CoreService {
    fn create_router(_state: Arc<ApiState>) -> ResourceServiceRouter {
        async fn me(ctx: ServiceRequestContext) -> impl IntoResponse {
            (StatusCode::OK, Json(ctx.identity))
        }

        async fn health() -> impl IntoResponse {
            (StatusCode::OK, "ok")
        }

        ResourceServiceRouter::new(
            "core",
            "/core",
            Router::new().route("/me", get(me)).route("/health", get(health)),
        )
    }
}
