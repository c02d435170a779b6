use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error as ThisError;

/// Error taxonomy for the relay.
///
/// The first five variants mirror the lifecycle of a watcher: configuration is
/// checked before anything runs, connection and resolution failures abort a
/// single start attempt, feed faults hit an already-active subscription, and
/// delivery failures are recorded per attempt and never escalated.
#[derive(Debug, ThisError)]
pub enum WatchpostError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot reach source: {0}")]
    Connection(String),

    #[error("cannot resolve a namespace to watch: {0}")]
    Resolution(String),

    #[error("change feed fault: {0}")]
    Feed(String),

    #[error("webhook delivery failed: {0}")]
    Delivery(String),

    #[error("source engine {0} is not implemented")]
    UnimplementedEngine(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("actor error: {0}")]
    Actor(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl IntoResponse for WatchpostError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_body) = match self {
            WatchpostError::NotFound(what) => {
                let body = ApiErrorObject {
                    code: "NOT_FOUND".to_string(),
                    message: format!("{what} not found."),
                    details: None,
                };
                (StatusCode::NOT_FOUND, body)
            }
            WatchpostError::Configuration(msg) | WatchpostError::UnimplementedEngine(msg) => {
                let body = ApiErrorObject {
                    code: "INVALID_CONFIGURATION".to_string(),
                    message: msg,
                    details: None,
                };
                (StatusCode::UNPROCESSABLE_ENTITY, body)
            }
            WatchpostError::Connection(msg) | WatchpostError::Resolution(msg) => {
                let body = ApiErrorObject {
                    code: "SOURCE_UNAVAILABLE".to_string(),
                    message: msg,
                    details: None,
                };
                (StatusCode::BAD_GATEWAY, body)
            }
            WatchpostError::Delivery(msg) | WatchpostError::Feed(msg) => {
                let body = ApiErrorObject {
                    code: "UPSTREAM_ERROR".to_string(),
                    message: msg,
                    details: None,
                };
                (StatusCode::BAD_GATEWAY, body)
            }
            WatchpostError::Reqwest(e) => {
                let body = ApiErrorObject {
                    code: "UPSTREAM_ERROR".to_string(),
                    message: e.to_string(),
                    details: None,
                };
                (StatusCode::BAD_GATEWAY, body)
            }
            WatchpostError::Database(_)
            | WatchpostError::Actor(_)
            | WatchpostError::Json(_)
            | WatchpostError::Url(_)
            | WatchpostError::Unexpected(_) => {
                let body = ApiErrorObject {
                    code: "INTERNAL_ERROR".to_string(),
                    message: "An internal server error occurred.".to_string(),
                    details: None,
                };
                (StatusCode::INTERNAL_SERVER_ERROR, body)
            }
        };
        (status, Json(ApiErrorResponse { error: error_body })).into_response()
    }
}

/// Standardized API error response body.
#[derive(Serialize)]
pub struct ApiErrorObject {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorObject,
}
