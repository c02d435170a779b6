//! Configuration store: persistence collaborator for watchers, sources and
//! delivery logs, kept behind an actor so all SQL runs off one owner.
//!
//! Layout:
//! - `models.rs`: domain structs plus their raw SQLite rows
//! - `patch.rs`: create/patch payloads used by the admin API
//! - `schema.rs`: SQL DDL (SQLite-first)
//! - `actor.rs`: the actor, its messages and the cloneable handle

pub mod actor;
pub mod models;
pub mod patch;
pub mod schema;

pub use actor::{ConfigStoreHandle, ConfigStoreMessage, spawn};
pub use models::{
    DatabaseSource, DeliveryLogEntry, DeliveryStatus, LogStats, OperationKind, SourceId,
    SourceKind, Watcher, WatcherId, WebhookMethod,
};
pub use patch::{LogCreate, SourceCreate, SourcePatch, WatcherCreate, WatcherPatch};
pub use schema::SQLITE_INIT;
