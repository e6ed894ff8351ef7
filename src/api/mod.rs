pub mod auth;
pub mod context;
pub mod core;
pub mod error;
pub mod resource_service;
pub mod services;

use std::{sync::Arc, time::Instant};

use anyhow::Result;
use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    api::{
        auth::AuthHandler,
        resource_service::{ResourceService, ResourceServiceRouter},
    },
    controller::{
        ControllerContext, power::PowerAggregator, provision::Provisioner,
        records::RecordManager, teardown::Teardown,
    },
};

pub struct ApiState {
    pub ctx: ControllerContext,
    pub provisioner: Arc<Provisioner>,
    pub teardown: Teardown,
    pub aggregator: PowerAggregator,
    pub records: RecordManager,
    pub auth_handler: Arc<AuthHandler>,
}

impl ApiState {
    pub fn new(provisioner: Arc<Provisioner>, auth_handler: Arc<AuthHandler>) -> Self {
        let ctx = provisioner.context().clone();
        Self {
            teardown: Teardown::new(provisioner.clone()),
            aggregator: PowerAggregator::new(ctx.clone()),
            records: RecordManager::new(ctx.clone()),
            ctx,
            provisioner,
            auth_handler,
        }
    }
}

pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
}

pub struct ApiServer {
    state: Arc<ApiState>,
    config: ApiServerConfig,
    routers: Vec<ResourceServiceRouter>,
}

impl ApiServer {
    pub fn new(state: ApiState, config: ApiServerConfig) -> Self {
        Self {
            state: Arc::new(state),
            config,
            routers: vec![],
        }
    }

    pub fn add_service<R: ResourceService>(mut self) -> Self {
        let router = R::create_router(self.state.clone());
        self.routers.push(router);
        self
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let mut app = Router::new();

        for router in self.routers {
            info!("adding service {} at {}", router.name, router.base_path);
            app = app.nest(router.base_path, router.router);
        }

        let app = app.layer(middleware::from_fn(log_request));
        let app = app.with_state(self.state);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("starting api server on {}", addr);

        let listener = TcpListener::bind(addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    debug!(
        "{} {} -> {} in {:?}",
        method,
        path,
        response.status(),
        started.elapsed()
    );
    response
}
