use crate::error::WatchpostError;
use crate::server::router::AppState;
use crate::store::models::WebhookMethod;
use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub(crate) struct WebhookTest {
    url: String,
    #[serde(default)]
    method: Option<WebhookMethod>,
}

/// Fires a probe request at the given URL so an operator can verify a
/// webhook endpoint before binding a watcher to it.
pub(crate) async fn test(
    State(state): State<AppState>,
    Json(req): Json<WebhookTest>,
) -> Result<Json<Value>, WatchpostError> {
    let method = req.method.unwrap_or_default();
    let status = state.dispatcher.probe(&req.url, method).await?;
    Ok(Json(json!({
        "status": status,
        "ok": (200..300).contains(&status),
    })))
}
