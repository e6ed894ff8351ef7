use std::sync::Arc;

use axum::Router;

use crate::api::ApiState;

/// Routes of one service, nested under `base_path` by the server.
pub struct ResourceServiceRouter {
    pub name: &'static str,
    pub base_path: &'static str,
    pub router: Router<Arc<ApiState>>,
}

impl ResourceServiceRouter {
    pub fn new(name: &'static str, base_path: &'static str, router: Router<Arc<ApiState>>) -> Self {
        Self {
            name,
            base_path,
            router,
        }
    }
}

pub trait ResourceService {
    fn create_router(state: Arc<ApiState>) -> ResourceServiceRouter;
}
