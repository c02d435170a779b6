use crate::error::WatchpostError;
use crate::server::router::AppState;
use axum::{Json, extract::State};
use serde_json::{Value, json};

pub(crate) async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

pub(crate) async fn status(State(state): State<AppState>) -> Result<Json<Value>, WatchpostError> {
    let watchers = state.store.list_watchers().await?;
    let sources = state.store.list_sources().await?;
    let active = state.registry.active_watchers().await;

    Ok(Json(json!({
        "watchers": watchers.len(),
        "enabled_watchers": watchers.iter().filter(|w| w.enabled).count(),
        "sources": sources.len(),
        "active": active,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    })))
}
