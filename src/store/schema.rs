//! SQL DDL for initializing the configuration store.
//! SQLite-first design; enum and JSON values are stored as TEXT.

/// SQLite schema:
/// - `sources`: configured data sources
/// - `watchers`: one watched collection + webhook target per row
/// - `delivery_logs`: append-only record of delivery attempts
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    connection_string TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL  -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_sources_name ON sources(name);

CREATE TABLE IF NOT EXISTS watchers (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    source_id INTEGER NOT NULL,
    collection TEXT NOT NULL,
    namespace TEXT NULL,
    operations TEXT NOT NULL, -- JSON array of operation kinds
    webhook_url TEXT NOT NULL,
    webhook_method TEXT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    trigger_count INTEGER NOT NULL DEFAULT 0,
    config TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL  -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_watchers_name ON watchers(name);
CREATE INDEX IF NOT EXISTS idx_watchers_source ON watchers(source_id);

CREATE TABLE IF NOT EXISTS delivery_logs (
    id INTEGER PRIMARY KEY NOT NULL,
    watcher_id INTEGER NOT NULL,
    operation TEXT NOT NULL,
    status TEXT NOT NULL, -- success | failure
    message TEXT NOT NULL,
    response TEXT NULL, -- JSON snapshot
    error TEXT NULL,    -- JSON snapshot
    created_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_delivery_logs_watcher
    ON delivery_logs(watcher_id, created_at DESC);
"#;
