use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::info;

use crate::{
    api::{
        ApiState,
        context::{AdminRequestContext, ServiceRequestContext},
        resource_service::{ResourceService, ResourceServiceRouter},
    },
    error::RequestResult,
};

pub struct TemplateService {}

impl ResourceService for TemplateService {
    fn create_router(_state: Arc<ApiState>) -> ResourceServiceRouter {
        async fn list(
            state: State<Arc<ApiState>>,
            _ctx: ServiceRequestContext,
        ) -> RequestResult<Response> {
            let names = state
                .ctx
                .sessions
                .template_names()
                .await
                .context("failed to load templates")?;
            Ok((StatusCode::OK, Json(names)).into_response())
        }

        async fn refresh(
            state: State<Arc<ApiState>>,
            ctx: AdminRequestContext,
        ) -> RequestResult<Response> {
            let templates = state
                .ctx
                .sessions
                .refresh_templates()
                .await
                .context("failed to refresh templates")?;
            info!(
                "{} refreshed templates, {} known",
                ctx.identity.user_id,
                templates.len()
            );
            Ok((StatusCode::OK, Json(templates)).into_response())
        }

        ResourceServiceRouter::new(
            "templates",
            "/templates",
            Router::new()
                .route("/", get(list))
                .route("/refresh", post(refresh)),
        )
    }
}
