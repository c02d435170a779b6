use crate::error::WatchpostError;
use crate::server::router::AppState;
use crate::store::models::{DeliveryLogEntry, LogStats, WatcherId};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub(crate) struct LogQuery {
    limit: Option<i64>,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Path(watcher_id): Path<WatcherId>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<DeliveryLogEntry>>, WatchpostError> {
    let limit = query.limit.unwrap_or(100);
    Ok(Json(state.store.list_logs(watcher_id, limit).await?))
}

pub(crate) async fn stats(
    State(state): State<AppState>,
    Path(watcher_id): Path<WatcherId>,
) -> Result<Json<LogStats>, WatchpostError> {
    Ok(Json(state.store.log_stats(watcher_id).await?))
}

pub(crate) async fn clear(
    State(state): State<AppState>,
    Path(watcher_id): Path<WatcherId>,
) -> Result<Json<Value>, WatchpostError> {
    let deleted = state.store.clear_logs(watcher_id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}
