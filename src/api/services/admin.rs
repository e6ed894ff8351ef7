use std::{net::Ipv4Addr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    api::{
        ApiState,
        context::AdminRequestContext,
        resource_service::{ResourceService, ResourceServiceRouter},
    },
    error::RequestResult,
};

#[derive(Debug, Deserialize)]
struct SeedIps {
    ips: Vec<Ipv4Addr>,
}

pub struct AdminService {}

impl ResourceService for AdminService {
    fn create_router(_state: Arc<ApiState>) -> ResourceServiceRouter {
        async fn list_ips(
            state: State<Arc<ApiState>>,
            _ctx: AdminRequestContext,
        ) -> RequestResult<Response> {
            let leases = state.ctx.ips.list()?;
            Ok((StatusCode::OK, Json(leases)).into_response())
        }

        async fn seed_ips(
            state: State<Arc<ApiState>>,
            ctx: AdminRequestContext,
            Json(request): Json<SeedIps>,
        ) -> RequestResult<Response> {
            let added = state.ctx.ips.seed(&request.ips)?;
            info!(
                "{} seeded {} of {} addresses",
                ctx.identity.user_id,
                added,
                request.ips.len()
            );
            Ok((StatusCode::OK, Json(json!({ "added": added }))).into_response())
        }

        ResourceServiceRouter::new(
            "admin",
            "/admin",
            Router::new().route("/ips", get(list_ips).post(seed_ips)),
        )
    }
}
