use super::routes::{logs, sources, status, watchers, webhooks};
use crate::engine::{DeliveryDispatcher, WatcherRegistry};
use crate::store::ConfigStoreHandle;
use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use std::time::Instant;

/// Shared state for the administration API.
#[derive(Clone)]
pub struct AppState {
    pub store: ConfigStoreHandle,
    pub registry: WatcherRegistry,
    pub dispatcher: DeliveryDispatcher,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: ConfigStoreHandle,
        registry: WatcherRegistry,
        dispatcher: DeliveryDispatcher,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

pub fn app_router(state: AppState) -> Router {
    let watchers = Router::new()
        .route("/", get(watchers::list).post(watchers::create))
        .route(
            "/{id}",
            get(watchers::get_one)
                .put(watchers::update)
                .delete(watchers::remove),
        )
        .route("/source/{source_id}", get(watchers::by_source))
        .route("/{id}/start", post(watchers::start))
        .route("/{id}/stop", post(watchers::stop))
        .route("/{id}/logs", get(watchers::logs));

    let sources = Router::new()
        .route("/", get(sources::list).post(sources::create))
        .route(
            "/{id}",
            get(sources::get_one)
                .put(sources::update)
                .delete(sources::remove),
        );

    let logs = Router::new()
        .route("/{watcher_id}", get(logs::list).delete(logs::clear))
        .route("/{watcher_id}/stats", get(logs::stats));

    Router::new()
        .route("/health", get(status::health))
        .route("/api/status", get(status::status))
        .nest("/api/watchers", watchers)
        .nest("/api/sources", sources)
        .nest("/api/logs", logs)
        .route("/api/webhooks/test", post(webhooks::test))
        .fallback(not_found_handler)
        .with_state(state)
}
