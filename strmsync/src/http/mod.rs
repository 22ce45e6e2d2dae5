//! Control-plane and webhook HTTP surface.

pub mod routes;
pub mod webhook;

use std::sync::Arc;

use camino::Utf8PathBuf;
use hyper::{Body, Request};
use tokio_util::sync::CancellationToken;
use utils::http::endpoint;
use utils::http::error::ApiError;
use utils::http::RouterBuilder;

use crate::config::Settings;
use crate::fetch::ClientPool;
use crate::scheduler::CronAdapter;
use crate::supervisor::TaskSupervisor;

/// Everything the request handlers need, shared across both routers.
pub struct ApiState {
    pub supervisor: Arc<TaskSupervisor>,
    pub cron: Arc<tokio::sync::Mutex<CronAdapter>>,
    pub settings: Settings,
    pub log_dir: Utf8PathBuf,
    pub pool: Arc<ClientPool>,
    pub cancel: CancellationToken,
}

pub(crate) fn get_state(request: &Request<Body>) -> &ApiState {
    use routerify::ext::RequestExt;
    request
        .data::<Arc<ApiState>>()
        .expect("api state is always provided")
        .as_ref()
}

pub fn make_router(state: Arc<ApiState>) -> RouterBuilder<Body, ApiError> {
    endpoint::make_router()
        .data(state.clone())
        .scope("/api", routes::api_router(state.clone()))
        .scope("/webhooks", webhook::webhook_router(state))
}
