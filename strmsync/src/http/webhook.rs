//! Webhook endpoint for external "new media" notifications.
//!
//! A valid event names a directory that an external manager just delivered.
//! The handler answers immediately and schedules the actual work: wait out
//! the configured delay, refresh the remote's listing cache for the affected
//! subtree, then submit a synchronization confined to it.

use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Request, Response, StatusCode};
use routerify::Router;
use strmsync_api::models::{ApiResponse, WebhookPayload};
use tracing::{error, info, info_span, warn, Instrument};
use utils::http::endpoint::request_span;
use utils::http::error::ApiError;
use utils::http::json::{json_request, json_response};
use utils::http::request::{get_request_param, parse_query_param};

use super::{get_state, ApiState};
use crate::alist::AlistClient;
use crate::supervisor::SubmitOutcome;

/// Shorter delays are clamped up to this: the remote needs time to finish
/// ingesting the delivered files before a refresh sees them.
pub const MIN_WEBHOOK_DELAY: Duration = Duration::from_secs(180);

pub fn webhook_router(state: Arc<ApiState>) -> Router<Body, ApiError> {
    Router::builder()
        .data(state)
        .get("/:token", |r| request_span(r, liveness_handler))
        .get("/:token/", |r| request_span(r, liveness_handler))
        .post("/:token/single", |r| request_span(r, single_handler))
        .build()
        .expect("construct the webhook router")
}

fn check_webhook_token(request: &Request<Body>) -> Result<(), ApiError> {
    let state = get_state(request);
    let token = get_request_param(request, "token")?;
    if state.settings.webhook_token.is_empty() || token != state.settings.webhook_token {
        return Err(ApiError::Unauthorized("invalid webhook token".to_owned()));
    }
    Ok(())
}

async fn liveness_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    check_webhook_token(&request)?;
    json_response(
        StatusCode::OK,
        super::routes::service_status("webhook endpoint is running"),
    )
}

/// What an actionable event asks for.
#[derive(Debug, PartialEq, Eq)]
struct EventAction {
    task_id: String,
    sub_dir: String,
}

/// Applies the guards in order; `Err` carries the reason the event is not
/// actionable. Only a whole-directory event with a category passes.
fn evaluate_event(
    payload: &WebhookPayload,
    expected_kind: Option<&str>,
) -> Result<EventAction, String> {
    let Some(expected_kind) = expected_kind.filter(|k| !k.is_empty()) else {
        return Err("no type query parameter".to_owned());
    };
    if payload.kind != expected_kind {
        return Err(format!(
            "event type {} does not match the expected {expected_kind}",
            payload.kind
        ));
    }
    if payload.data.fileitem.kind.as_deref() != Some("dir") {
        return Err("only directory events trigger a synchronization".to_owned());
    }
    let Some(name) = payload
        .data
        .fileitem
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
    else {
        return Err("the event carries no directory name".to_owned());
    };
    // Season-level scrapes arrive separately; only the whole-series event
    // should schedule work.
    if payload.data.mediainfo.kind.as_deref() == Some("series") && name.contains("Season") {
        return Err(format!(
            "{name} is a season directory, waiting for the whole-series event"
        ));
    }
    let Some(task_id) = payload
        .data
        .mediainfo
        .category
        .as_deref()
        .filter(|c| !c.is_empty())
    else {
        return Err("the event carries no category".to_owned());
    };
    Ok(EventAction {
        task_id: task_id.to_owned(),
        sub_dir: name.to_owned(),
    })
}

/// Answers immediately; the cache refresh and the submission run as a
/// detached task once the delay has elapsed.
async fn single_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    check_webhook_token(&request)?;
    let expected_kind: Option<String> = parse_query_param(&request, "type")?;
    let wait: Option<u64> = parse_query_param(&request, "wait")?;
    let payload: WebhookPayload = json_request(&mut request).await?;
    let state = get_state(&request);

    let action = match evaluate_event(&payload, expected_kind.as_deref()) {
        Ok(action) => action,
        Err(reason) => return skip(&reason),
    };
    let Some(source) = state.supervisor.source(&action.task_id) else {
        return skip(&format!(
            "no task with id {} is configured",
            action.task_id
        ));
    };

    let wait = effective_delay(wait);
    let supervisor = state.supervisor.clone();
    let pool = state.pool.clone();
    let cancel = state.cancel.clone();
    let source = source.clone();
    let sub_dir = action.sub_dir.clone();
    tokio::spawn(
        async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            let client = match AlistClient::new(
                &source.url,
                &source.username,
                &source.password,
                &source.token,
                pool,
                cancel.clone(),
            ) {
                Ok(client) => client,
                Err(e) => {
                    error!("cannot reach the remote for {}: {e:#}", source.id);
                    return;
                }
            };
            if let Err(e) = client.refresh_tree(&source.source_dir, &sub_dir).await {
                warn!("listing cache refresh for {sub_dir} failed: {e:#}");
            }
            match supervisor.submit(&source.id, false, &sub_dir) {
                SubmitOutcome::Admitted => {
                    info!("webhook admitted task {} for {sub_dir}", source.id)
                }
                SubmitOutcome::AlreadyPresent => warn!(
                    "task {} is already queued or running, webhook submission skipped",
                    source.id
                ),
                SubmitOutcome::UnknownTask => {}
            }
        }
        .instrument(info_span!("webhook_followup", task_id = %action.task_id)),
    );

    info!(
        "webhook scheduled a sync of {} in {}s",
        action.sub_dir,
        wait.as_secs()
    );
    json_response(
        StatusCode::OK,
        ApiResponse::success(format!(
            "synchronization of {} scheduled in {}s",
            action.sub_dir,
            wait.as_secs()
        )),
    )
}

fn skip(reason: &str) -> Result<Response<Body>, ApiError> {
    info!("webhook event skipped: {reason}");
    json_response(
        StatusCode::OK,
        ApiResponse::failed(format!("{reason}, skipping")),
    )
}

/// Clamp applied to the `wait` query parameter.
fn effective_delay(requested: Option<u64>) -> Duration {
    Duration::from_secs(requested.unwrap_or(MIN_WEBHOOK_DELAY.as_secs())).max(MIN_WEBHOOK_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> WebhookPayload {
        serde_json::from_str(json).unwrap()
    }

    const COMPLETE: &str = r#"{
        "type": "metadata.scrape.complete",
        "data": {
            "mediainfo": {"category": "movies", "type": "movie"},
            "fileitem": {"type": "dir", "name": "Movie (2020)", "path": "/media/Movie (2020)"}
        }
    }"#;

    #[test]
    fn short_waits_are_clamped() {
        assert_eq!(effective_delay(Some(0)), MIN_WEBHOOK_DELAY);
        assert_eq!(effective_delay(Some(179)), MIN_WEBHOOK_DELAY);
        assert_eq!(effective_delay(None), MIN_WEBHOOK_DELAY);
        assert_eq!(effective_delay(Some(180)), Duration::from_secs(180));
        assert_eq!(effective_delay(Some(600)), Duration::from_secs(600));
    }

    #[test]
    fn complete_event_is_actionable() {
        let action =
            evaluate_event(&payload(COMPLETE), Some("metadata.scrape.complete")).unwrap();
        assert_eq!(
            action,
            EventAction {
                task_id: "movies".to_owned(),
                sub_dir: "Movie (2020)".to_owned(),
            }
        );
    }

    #[test]
    fn mismatched_type_is_skipped() {
        let err = evaluate_event(&payload(COMPLETE), Some("metadata.scrape")).unwrap_err();
        assert!(err.contains("does not match"));
        let err = evaluate_event(&payload(COMPLETE), None).unwrap_err();
        assert!(err.contains("no type query parameter"));
    }

    #[test]
    fn file_events_are_skipped() {
        let event = payload(
            r#"{
                "type": "t",
                "data": {
                    "mediainfo": {"category": "movies"},
                    "fileitem": {"type": "file", "name": "a.mkv"}
                }
            }"#,
        );
        let err = evaluate_event(&event, Some("t")).unwrap_err();
        assert!(err.contains("only directory events"));
    }

    #[test]
    fn season_directories_wait_for_the_series_event() {
        let event = payload(
            r#"{
                "type": "t",
                "data": {
                    "mediainfo": {"category": "shows", "type": "series"},
                    "fileitem": {"type": "dir", "name": "Show - Season 2"}
                }
            }"#,
        );
        let err = evaluate_event(&event, Some("t")).unwrap_err();
        assert!(err.contains("season directory"));

        // a whole-series directory passes
        let event = payload(
            r#"{
                "type": "t",
                "data": {
                    "mediainfo": {"category": "shows", "type": "series"},
                    "fileitem": {"type": "dir", "name": "Show"}
                }
            }"#,
        );
        assert!(evaluate_event(&event, Some("t")).is_ok());
    }

    #[test]
    fn missing_category_is_skipped() {
        let event = payload(
            r#"{
                "type": "t",
                "data": {"fileitem": {"type": "dir", "name": "Movie (2020)"}}
            }"#,
        );
        let err = evaluate_event(&event, Some("t")).unwrap_err();
        assert!(err.contains("no category"));
    }
}
