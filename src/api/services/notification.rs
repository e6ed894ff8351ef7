use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::{
    api::{
        ApiState,
        context::ServiceRequestContext,
        resource_service::{ResourceService, ResourceServiceRouter},
    },
    error::RequestResult,
};

pub struct NotificationService {}

impl ResourceService for NotificationService {
    fn create_router(_state: Arc<ApiState>) -> ResourceServiceRouter {
        async fn list(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
        ) -> RequestResult<Response> {
            let notifications = state.ctx.notifier.list(&ctx.identity.user_id)?;
            Ok((StatusCode::OK, Json(notifications)).into_response())
        }

        async fn toggle_read(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
            Path(id): Path<u64>,
        ) -> RequestResult<Response> {
            let notification = state.ctx.notifier.toggle_read(&ctx.identity.user_id, id)?;
            Ok((StatusCode::OK, Json(notification)).into_response())
        }

        ResourceServiceRouter::new(
            "notifications",
            "/notifications",
            Router::new()
                .route("/", get(list))
                .route("/{id}/toggle-read", post(toggle_read)),
        )
    }
}
