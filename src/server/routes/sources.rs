use crate::error::WatchpostError;
use crate::server::router::AppState;
use crate::store::models::{DatabaseSource, SourceId};
use crate::store::patch::{SourceCreate, SourcePatch};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::warn;

pub(crate) async fn list(
    State(state): State<AppState>,
) -> Result<Json<Vec<DatabaseSource>>, WatchpostError> {
    Ok(Json(state.store.list_sources().await?))
}

pub(crate) async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<Json<DatabaseSource>, WatchpostError> {
    let source = state
        .store
        .get_source(id)
        .await?
        .ok_or_else(|| WatchpostError::NotFound(format!("source {id}")))?;
    Ok(Json(source))
}

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(create): Json<SourceCreate>,
) -> Result<(StatusCode, Json<DatabaseSource>), WatchpostError> {
    let source = state.store.create_source(create).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

/// Updates a source, then cycles the watchers bound to it so running feeds
/// pick up the new connection string or enablement.
pub(crate) async fn update(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
    Json(patch): Json<SourcePatch>,
) -> Result<Json<DatabaseSource>, WatchpostError> {
    state.store.patch_source(id, patch).await?;
    let source = state
        .store
        .get_source(id)
        .await?
        .ok_or_else(|| WatchpostError::NotFound(format!("source {id}")))?;

    for watcher in state.store.list_watchers_by_source(id).await? {
        if source.enabled && watcher.enabled {
            if let Err(e) = state.registry.restart(watcher.clone()).await {
                warn!(watcher = %watcher.name, error = %e, "failed to restart watcher after source update");
            }
        } else {
            state.registry.stop(watcher.id).await?;
        }
    }
    Ok(Json(source))
}

/// A source with watchers still attached cannot be deleted; detach or delete
/// the watchers first.
pub(crate) async fn remove(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<StatusCode, WatchpostError> {
    let dependents = state.store.list_watchers_by_source(id).await?;
    if !dependents.is_empty() {
        return Err(WatchpostError::Configuration(format!(
            "source {id} is referenced by {} watcher(s)",
            dependents.len()
        )));
    }
    state.store.delete_source(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
