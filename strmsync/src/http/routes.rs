//! Token-guarded control API.

use std::sync::Arc;

use anyhow::anyhow;
use hyper::{header, Body, Request, Response, StatusCode};
use routerify::Router;
use strmsync_api::models::{ApiResponse, JobsResponse, LogsResponse, RunTaskRequest, ServiceStatus};
use tracing::info;
use utils::http::endpoint::{request_span, token_auth_middleware};
use utils::http::error::ApiError;
use utils::http::json::{json_request, json_response};
use utils::http::request::parse_query_param;

use super::{get_state, ApiState};
use crate::supervisor::SubmitOutcome;

pub fn api_router(state: Arc<ApiState>) -> Router<Body, ApiError> {
    let api_token = state.settings.api_token.clone();
    Router::builder()
        .data(state)
        .middleware(token_auth_middleware(api_token))
        .get("/", |r| request_span(r, status_handler))
        .post("/strm/run", |r| request_span(r, run_task_handler))
        .get("/logs", |r| request_span(r, logs_handler))
        .get("/jobs", |r| request_span(r, jobs_handler))
        .build()
        .expect("construct the control api router")
}

pub(super) fn service_status(message: &str) -> ServiceStatus {
    ServiceStatus {
        status: "ok".to_owned(),
        version: crate::VERSION.to_owned(),
        message: message.to_owned(),
    }
}

async fn status_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    json_response(StatusCode::OK, service_status("control API is running"))
}

async fn run_task_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let body: RunTaskRequest = json_request(&mut request).await?;
    let state = get_state(&request);

    let Some(task_id) = body.task_id.filter(|id| !id.is_empty()) else {
        return json_response(StatusCode::OK, ApiResponse::failed("no task_id specified"));
    };

    match state.supervisor.submit(&task_id, false, "") {
        SubmitOutcome::Admitted => {
            info!("manual trigger admitted task {task_id}");
            json_response(
                StatusCode::OK,
                ApiResponse::success(format!("task {task_id} submitted")),
            )
        }
        SubmitOutcome::AlreadyPresent => json_response(
            StatusCode::OK,
            ApiResponse::warning(format!("task {task_id} is already queued or running")),
        ),
        SubmitOutcome::UnknownTask => Err(ApiError::NotFound(anyhow!(
            "no task with id {task_id} is configured"
        ))),
    }
}

/// Without a `filename` parameter: the list of available log files. With
/// one: the file itself, as a download.
async fn logs_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let filename: Option<String> = parse_query_param(&request, "filename")?;

    match filename {
        Some(name) => {
            // day-stamped basenames only
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
            {
                return Err(ApiError::BadRequest(anyhow!("invalid log file name")));
            }
            let path = state.log_dir.join(format!("{name}.log"));
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ApiError::NotFound(anyhow!("no log file for {name}")))
                }
                Err(e) => return Err(ApiError::InternalServerError(e.into())),
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{name}.log\""),
                )
                .body(Body::from(content))
                .map_err(|e| ApiError::InternalServerError(e.into()))
        }
        None => {
            let mut dir = match tokio::fs::read_dir(&state.log_dir).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ApiError::NotFound(anyhow!("the log directory does not exist")))
                }
                Err(e) => return Err(ApiError::InternalServerError(e.into())),
            };
            let mut files = Vec::new();
            while let Some(dent) = dir
                .next_entry()
                .await
                .map_err(|e| ApiError::InternalServerError(e.into()))?
            {
                let name = dent.file_name();
                let name = name.to_string_lossy();
                if let Some(stem) = name.strip_suffix(".log") {
                    files.push(stem.to_owned());
                }
            }
            files.sort_by(|a, b| b.cmp(a));
            let total = files.len();
            json_response(StatusCode::OK, LogsResponse { files, total })
        }
    }
}

async fn jobs_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let cron = state.cron.lock().await.jobs().await;
    let all = state.supervisor.known_tasks();
    json_response(StatusCode::OK, JobsResponse { cron, all })
}
