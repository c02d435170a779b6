use crate::error::WatchpostError;
use crate::server::router::AppState;
use crate::store::models::{DeliveryLogEntry, Watcher, WatcherId};
use crate::store::patch::{WatcherCreate, WatcherPatch};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

pub(crate) async fn list(
    State(state): State<AppState>,
) -> Result<Json<Vec<Watcher>>, WatchpostError> {
    Ok(Json(state.store.list_watchers().await?))
}

pub(crate) async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<WatcherId>,
) -> Result<Json<Watcher>, WatchpostError> {
    let watcher = state
        .store
        .get_watcher(id)
        .await?
        .ok_or_else(|| WatchpostError::NotFound(format!("watcher {id}")))?;
    Ok(Json(watcher))
}

pub(crate) async fn by_source(
    State(state): State<AppState>,
    Path(source_id): Path<i64>,
) -> Result<Json<Vec<Watcher>>, WatchpostError> {
    Ok(Json(state.store.list_watchers_by_source(source_id).await?))
}

/// Creates a watcher and starts it right away when enabled. A start failure
/// does not undo the creation; the record stays inactive for a later start.
pub(crate) async fn create(
    State(state): State<AppState>,
    Json(create): Json<WatcherCreate>,
) -> Result<(StatusCode, Json<Watcher>), WatchpostError> {
    let watcher = state.store.create_watcher(create).await?;
    if watcher.enabled {
        if let Err(e) = state.registry.start(watcher.clone()).await {
            warn!(watcher = %watcher.name, error = %e, "watcher created but failed to start");
        }
    }
    Ok((StatusCode::CREATED, Json(watcher)))
}

/// Applies a partial update, then restarts the subscription so the running
/// state observes the new configuration.
pub(crate) async fn update(
    State(state): State<AppState>,
    Path(id): Path<WatcherId>,
    Json(patch): Json<WatcherPatch>,
) -> Result<Json<Watcher>, WatchpostError> {
    state.store.patch_watcher(id, patch).await?;
    let watcher = state
        .store
        .get_watcher(id)
        .await?
        .ok_or_else(|| WatchpostError::NotFound(format!("watcher {id}")))?;

    if watcher.enabled {
        if let Err(e) = state.registry.restart(watcher.clone()).await {
            warn!(watcher = %watcher.name, error = %e, "watcher updated but failed to restart");
        }
    } else {
        state.registry.stop(id).await?;
    }
    Ok(Json(watcher))
}

pub(crate) async fn remove(
    State(state): State<AppState>,
    Path(id): Path<WatcherId>,
) -> Result<StatusCode, WatchpostError> {
    state.registry.stop(id).await?;
    state.store.delete_watcher(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn start(
    State(state): State<AppState>,
    Path(id): Path<WatcherId>,
) -> Result<Json<Value>, WatchpostError> {
    let watcher = state
        .store
        .get_watcher(id)
        .await?
        .ok_or_else(|| WatchpostError::NotFound(format!("watcher {id}")))?;
    state.registry.start(watcher).await?;
    Ok(Json(json!({ "status": "started" })))
}

pub(crate) async fn stop(
    State(state): State<AppState>,
    Path(id): Path<WatcherId>,
) -> Result<Json<Value>, WatchpostError> {
    state.registry.stop(id).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogQuery {
    limit: Option<i64>,
}

pub(crate) async fn logs(
    State(state): State<AppState>,
    Path(id): Path<WatcherId>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<DeliveryLogEntry>>, WatchpostError> {
    let limit = query.limit.unwrap_or(100);
    Ok(Json(state.store.list_logs(id, limit).await?))
}
