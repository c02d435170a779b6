//! Administration HTTP API: watcher and source CRUD, lifecycle control,
//! delivery logs, and health/status endpoints.

pub mod router;
pub(crate) mod routes;

pub use router::{AppState, app_router};
