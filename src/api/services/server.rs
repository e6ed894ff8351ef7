use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::{
    api::{
        ApiState,
        context::ServiceRequestContext,
        resource_service::{ResourceService, ResourceServiceRouter},
    },
    error::{RequestError, RequestResult},
    resources::{
        machine::{CreateServerRequest, PowerAction},
        subdomain::{CreateRecordRequest, DeleteRecordRequest},
    },
};

pub struct ServerService {}

impl ResourceService for ServerService {
    fn create_router(_state: Arc<ApiState>) -> ResourceServiceRouter {
        async fn list(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
        ) -> RequestResult<Response> {
            let views = state
                .aggregator
                .list_with_power_status(None, &ctx.identity)
                .await?;
            Ok((StatusCode::OK, Json(views)).into_response())
        }

        async fn create(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
            Json(request): Json<CreateServerRequest>,
        ) -> RequestResult<Response> {
            let started = state
                .provisioner
                .create_server(&ctx.identity, request)
                .await?;
            Ok((StatusCode::CREATED, Json(started)).into_response())
        }

        async fn get_one(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
            Path(id): Path<u64>,
        ) -> RequestResult<Response> {
            let views = state
                .aggregator
                .list_with_power_status(Some(id), &ctx.identity)
                .await?;
            let Some(view) = views.into_iter().next() else {
                return Err(RequestError::NotFound);
            };
            Ok((StatusCode::OK, Json(view)).into_response())
        }

        async fn delete(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
            Path(id): Path<u64>,
        ) -> RequestResult<Response> {
            state.teardown.delete_server(&ctx.identity, id).await?;
            Ok((StatusCode::OK, Json(json!({ "deleted": id }))).into_response())
        }

        async fn power(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
            Path((id, action)): Path<(u64, String)>,
        ) -> RequestResult<Response> {
            let Ok(parsed) = action.parse::<PowerAction>() else {
                return Ok((StatusCode::BAD_REQUEST, "unknown power action").into_response());
            };

            state
                .aggregator
                .power_action(&ctx.identity, id, parsed)
                .await?;
            Ok((StatusCode::OK, Json(json!({ "id": id, "action": action }))).into_response())
        }

        async fn list_records(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
            Path(id): Path<u64>,
        ) -> RequestResult<Response> {
            let records = state.records.list_records(&ctx.identity, id)?;
            Ok((StatusCode::OK, Json(records)).into_response())
        }

        async fn create_record(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
            Path(id): Path<u64>,
            Json(request): Json<CreateRecordRequest>,
        ) -> RequestResult<Response> {
            let record = state
                .records
                .create_record(&ctx.identity, id, request)
                .await?;
            Ok((StatusCode::CREATED, Json(record)).into_response())
        }

        async fn delete_record(
            state: State<Arc<ApiState>>,
            ctx: ServiceRequestContext,
            Path(id): Path<u64>,
            Json(request): Json<DeleteRecordRequest>,
        ) -> RequestResult<Response> {
            state
                .records
                .delete_record(&ctx.identity, id, request)
                .await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }

        ResourceServiceRouter::new(
            "servers",
            "/servers",
            Router::new()
                .route("/", get(list).post(create))
                .route("/{id}", get(get_one).delete(delete))
                .route("/{id}/power/{action}", post(power))
                .route(
                    "/{id}/records",
                    get(list_records).post(create_record).delete(delete_record),
                ),
        )
    }
}

pub struct DnsService {}

impl ResourceService for DnsService {
    fn create_router(_state: Arc<ApiState>) -> ResourceServiceRouter {
        async fn list_zones(
            state: State<Arc<ApiState>>,
            _ctx: ServiceRequestContext,
        ) -> RequestResult<Response> {
            let zones = state.records.list_zones().await?;
            Ok((StatusCode::OK, Json(zones)).into_response())
        }

        ResourceServiceRouter::new(
            "dns",
            "/dns",
            Router::new().route("/zones", get(list_zones)),
        )
    }
}
