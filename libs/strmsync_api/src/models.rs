use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome classification carried by every control-API and webhook response.
/// `Warning` covers requests that were understood but intentionally not acted
/// on, e.g. re-submitting a task that is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Warning,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: ResponseStatus,
    pub message: String,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>) -> Self {
        ApiResponse {
            status: ResponseStatus::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ApiResponse {
            status: ResponseStatus::Warning,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ApiResponse {
            status: ResponseStatus::Failed,
            message: message.into(),
        }
    }
}

/// Response of `GET /api/` and of the webhook liveness endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub version: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunTaskRequest {
    #[serde(default)]
    pub task_id: Option<String>,
}

/// Response of `GET /api/logs` without a `filename` parameter: day-stamped
/// log file names, newest first, without the `.log` suffix.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub files: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CronJobInfo {
    pub id: String,
    pub cron: String,
    pub next_run_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobsResponse {
    pub cron: Vec<CronJobInfo>,
    /// Task ids currently known to the supervisor, queued or running.
    pub all: Vec<String>,
}

/// Body of `POST /webhooks/{token}/single`. The payload shape varies with the
/// event type; every field the dispatcher consults is optional so that the
/// guards, not the deserializer, decide what to reject.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: WebhookData,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookData {
    #[serde(default)]
    pub mediainfo: MediaInfo,
    #[serde(default)]
    pub fileitem: FileItem,
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileItem {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_status_serializes_lowercase() {
        let resp = ApiResponse::warning("task movies is already queued");
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            "{\"status\":\"warning\",\"message\":\"task movies is already queued\"}"
        );
    }

    #[test]
    fn webhook_payload_tolerates_missing_fields() {
        let payload: WebhookPayload =
            serde_json::from_str("{\"type\":\"metadata.scrape.complete\"}").unwrap();
        assert_eq!(payload.kind, "metadata.scrape.complete");
        assert!(payload.data.mediainfo.category.is_none());
        assert!(payload.data.fileitem.kind.is_none());
    }

    #[test]
    fn webhook_payload_full_shape() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{
                "type": "metadata.scrape.complete",
                "data": {
                    "mediainfo": {"category": "movies", "type": "movie"},
                    "fileitem": {"type": "dir", "name": "Movie (2020)", "path": "/media/Movie (2020)"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(payload.data.mediainfo.category.as_deref(), Some("movies"));
        assert_eq!(payload.data.fileitem.kind.as_deref(), Some("dir"));
        assert_eq!(payload.data.fileitem.name.as_deref(), Some("Movie (2020)"));
    }
}
