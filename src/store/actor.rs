use super::models::{
    DatabaseSource, DeliveryLogEntry, LogRow, LogStats, SourceId, SourceRow, Watcher, WatcherId,
    WatcherRow,
};
use super::patch::{LogCreate, SourceCreate, SourcePatch, WatcherCreate, WatcherPatch};
use super::schema::SQLITE_INIT;
use crate::error::WatchpostError;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::{str::FromStr, time::Duration};
use tracing::{debug, info};

type Reply<T> = RpcReplyPort<Result<T, WatchpostError>>;

/// Messages handled by the configuration store actor.
///
/// The core engine only uses the read messages plus `IncrementTriggerCount`
/// and `InsertLog`; every other write is driven by the administration API.
#[derive(Debug)]
pub enum ConfigStoreMessage {
    CreateWatcher(WatcherCreate, Reply<Watcher>),
    PatchWatcher(WatcherId, WatcherPatch, Reply<()>),
    DeleteWatcher(WatcherId, Reply<()>),
    GetWatcher(WatcherId, Reply<Option<Watcher>>),
    ListWatchers(Reply<Vec<Watcher>>),
    ListWatchersBySource(SourceId, Reply<Vec<Watcher>>),

    /// Atomically bump a watcher's trigger counter by exactly 1.
    IncrementTriggerCount(WatcherId, Reply<()>),

    CreateSource(SourceCreate, Reply<DatabaseSource>),
    PatchSource(SourceId, SourcePatch, Reply<()>),
    DeleteSource(SourceId, Reply<()>),
    GetSource(SourceId, Reply<Option<DatabaseSource>>),
    ListSources(Reply<Vec<DatabaseSource>>),

    /// Append one delivery attempt to the log.
    InsertLog(LogCreate, Reply<DeliveryLogEntry>),
    ListLogs(WatcherId, i64, Reply<Vec<DeliveryLogEntry>>),
    LogStats(WatcherId, Reply<LogStats>),
    ClearLogs(WatcherId, Reply<u64>),
}

/// Cloneable handle for interacting with the configuration store actor.
#[derive(Clone)]
pub struct ConfigStoreHandle {
    actor: ActorRef<ConfigStoreMessage>,
}

macro_rules! store_rpc {
    ($self:expr, $variant:ident $(, $arg:expr)*) => {
        ractor::call!($self.actor, ConfigStoreMessage::$variant $(, $arg)*)
            .map_err(|e| {
                WatchpostError::Actor(format!(concat!(stringify!($variant), " RPC failed: {}"), e))
            })?
    };
}

impl ConfigStoreHandle {
    pub async fn create_watcher(&self, create: WatcherCreate) -> Result<Watcher, WatchpostError> {
        store_rpc!(self, CreateWatcher, create)
    }

    pub async fn patch_watcher(
        &self,
        id: WatcherId,
        patch: WatcherPatch,
    ) -> Result<(), WatchpostError> {
        store_rpc!(self, PatchWatcher, id, patch)
    }

    pub async fn delete_watcher(&self, id: WatcherId) -> Result<(), WatchpostError> {
        store_rpc!(self, DeleteWatcher, id)
    }

    pub async fn get_watcher(&self, id: WatcherId) -> Result<Option<Watcher>, WatchpostError> {
        store_rpc!(self, GetWatcher, id)
    }

    pub async fn list_watchers(&self) -> Result<Vec<Watcher>, WatchpostError> {
        store_rpc!(self, ListWatchers)
    }

    pub async fn list_watchers_by_source(
        &self,
        source_id: SourceId,
    ) -> Result<Vec<Watcher>, WatchpostError> {
        store_rpc!(self, ListWatchersBySource, source_id)
    }

    pub async fn increment_trigger_count(&self, id: WatcherId) -> Result<(), WatchpostError> {
        store_rpc!(self, IncrementTriggerCount, id)
    }

    pub async fn create_source(
        &self,
        create: SourceCreate,
    ) -> Result<DatabaseSource, WatchpostError> {
        store_rpc!(self, CreateSource, create)
    }

    pub async fn patch_source(
        &self,
        id: SourceId,
        patch: SourcePatch,
    ) -> Result<(), WatchpostError> {
        store_rpc!(self, PatchSource, id, patch)
    }

    pub async fn delete_source(&self, id: SourceId) -> Result<(), WatchpostError> {
        store_rpc!(self, DeleteSource, id)
    }

    pub async fn get_source(
        &self,
        id: SourceId,
    ) -> Result<Option<DatabaseSource>, WatchpostError> {
        store_rpc!(self, GetSource, id)
    }

    pub async fn list_sources(&self) -> Result<Vec<DatabaseSource>, WatchpostError> {
        store_rpc!(self, ListSources)
    }

    pub async fn insert_log(&self, log: LogCreate) -> Result<DeliveryLogEntry, WatchpostError> {
        store_rpc!(self, InsertLog, log)
    }

    pub async fn list_logs(
        &self,
        watcher_id: WatcherId,
        limit: i64,
    ) -> Result<Vec<DeliveryLogEntry>, WatchpostError> {
        store_rpc!(self, ListLogs, watcher_id, limit)
    }

    pub async fn log_stats(&self, watcher_id: WatcherId) -> Result<LogStats, WatchpostError> {
        store_rpc!(self, LogStats, watcher_id)
    }

    pub async fn clear_logs(&self, watcher_id: WatcherId) -> Result<u64, WatchpostError> {
        store_rpc!(self, ClearLogs, watcher_id)
    }
}

struct ConfigStoreState {
    pool: SqlitePool,
}

struct ConfigStoreActor;

#[ractor::async_trait]
impl Actor for ConfigStoreActor {
    type Msg = ConfigStoreMessage;
    type State = ConfigStoreState;
    type Arguments = String;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        database_url: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        sqlx::raw_sql(SQLITE_INIT)
            .execute(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!("configuration store initialized");
        Ok(ConfigStoreState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let pool = &state.pool;
        match message {
            ConfigStoreMessage::CreateWatcher(create, reply) => {
                let _ = reply.send(create_watcher(pool, create).await);
            }
            ConfigStoreMessage::PatchWatcher(id, patch, reply) => {
                let _ = reply.send(patch_watcher(pool, id, patch).await);
            }
            ConfigStoreMessage::DeleteWatcher(id, reply) => {
                let _ = reply.send(delete_watcher(pool, id).await);
            }
            ConfigStoreMessage::GetWatcher(id, reply) => {
                let _ = reply.send(get_watcher(pool, id).await);
            }
            ConfigStoreMessage::ListWatchers(reply) => {
                let _ = reply.send(list_watchers(pool).await);
            }
            ConfigStoreMessage::ListWatchersBySource(source_id, reply) => {
                let _ = reply.send(list_watchers_by_source(pool, source_id).await);
            }
            ConfigStoreMessage::IncrementTriggerCount(id, reply) => {
                let _ = reply.send(increment_trigger_count(pool, id).await);
            }
            ConfigStoreMessage::CreateSource(create, reply) => {
                let _ = reply.send(create_source(pool, create).await);
            }
            ConfigStoreMessage::PatchSource(id, patch, reply) => {
                let _ = reply.send(patch_source(pool, id, patch).await);
            }
            ConfigStoreMessage::DeleteSource(id, reply) => {
                let _ = reply.send(delete_source(pool, id).await);
            }
            ConfigStoreMessage::GetSource(id, reply) => {
                let _ = reply.send(get_source(pool, id).await);
            }
            ConfigStoreMessage::ListSources(reply) => {
                let _ = reply.send(list_sources(pool).await);
            }
            ConfigStoreMessage::InsertLog(log, reply) => {
                let _ = reply.send(insert_log(pool, log).await);
            }
            ConfigStoreMessage::ListLogs(watcher_id, limit, reply) => {
                let _ = reply.send(list_logs(pool, watcher_id, limit).await);
            }
            ConfigStoreMessage::LogStats(watcher_id, reply) => {
                let _ = reply.send(log_stats(pool, watcher_id).await);
            }
            ConfigStoreMessage::ClearLogs(watcher_id, reply) => {
                let _ = reply.send(clear_logs(pool, watcher_id).await);
            }
        }
        Ok(())
    }
}

/// Spawns the configuration store actor against the given SQLite URL.
pub async fn spawn(database_url: &str) -> Result<ConfigStoreHandle, WatchpostError> {
    // Anonymous spawn: a process may host several stores (tests, embedding).
    let (actor, _jh) = Actor::spawn(None, ConfigStoreActor, database_url.to_string())
        .await
        .map_err(|e| WatchpostError::Actor(format!("ConfigStore spawn failed: {e}")))?;
    Ok(ConfigStoreHandle { actor })
}

const SELECT_WATCHER: &str = "SELECT id, name, source_id, collection, namespace, operations, \
     webhook_url, webhook_method, enabled, trigger_count, config, created_at, updated_at \
     FROM watchers";

const SELECT_SOURCE: &str = "SELECT id, name, kind, connection_string, config, enabled, \
     created_at, updated_at FROM sources";

const SELECT_LOG: &str = "SELECT id, watcher_id, operation, status, message, response, error, \
     created_at FROM delivery_logs";

async fn create_watcher(
    pool: &SqlitePool,
    create: WatcherCreate,
) -> Result<Watcher, WatchpostError> {
    let now = Utc::now();
    let operations = serde_json::to_string(&create.operations)?;
    let config = serde_json::to_string(&create.config)?;
    let method = create.webhook_method.map(|m| m.as_str().to_string());

    let res = sqlx::query(
        "INSERT INTO watchers \
         (name, source_id, collection, namespace, operations, webhook_url, webhook_method, \
          enabled, trigger_count, config, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
    )
    .bind(&create.name)
    .bind(create.source_id)
    .bind(&create.collection)
    .bind(&create.namespace)
    .bind(&operations)
    .bind(&create.webhook_url)
    .bind(&method)
    .bind(create.enabled)
    .bind(&config)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let id = res.last_insert_rowid();
    debug!(watcher_id = id, name = %create.name, "watcher created");
    get_watcher(pool, id)
        .await?
        .ok_or_else(|| WatchpostError::Unexpected(format!("watcher {id} vanished after insert")))
}

async fn patch_watcher(
    pool: &SqlitePool,
    id: WatcherId,
    patch: WatcherPatch,
) -> Result<(), WatchpostError> {
    let operations = patch
        .operations
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let config = patch.config.as_ref().map(serde_json::to_string).transpose()?;
    let method = patch.webhook_method.map(|m| m.as_str().to_string());
    let updated_at = Utc::now();

    let res = sqlx::query(
        "UPDATE watchers SET \
             name = COALESCE(?, name), \
             source_id = COALESCE(?, source_id), \
             collection = COALESCE(?, collection), \
             namespace = COALESCE(?, namespace), \
             operations = COALESCE(?, operations), \
             webhook_url = COALESCE(?, webhook_url), \
             webhook_method = COALESCE(?, webhook_method), \
             enabled = COALESCE(?, enabled), \
             config = COALESCE(?, config), \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(&patch.name)
    .bind(patch.source_id)
    .bind(&patch.collection)
    .bind(&patch.namespace)
    .bind(&operations)
    .bind(&patch.webhook_url)
    .bind(&method)
    .bind(patch.enabled)
    .bind(&config)
    .bind(updated_at)
    .bind(id)
    .execute(pool)
    .await?;

    if res.rows_affected() == 0 {
        return Err(WatchpostError::NotFound(format!("watcher {id}")));
    }
    Ok(())
}

async fn delete_watcher(pool: &SqlitePool, id: WatcherId) -> Result<(), WatchpostError> {
    let res = sqlx::query("DELETE FROM watchers WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(WatchpostError::NotFound(format!("watcher {id}")));
    }
    Ok(())
}

async fn get_watcher(pool: &SqlitePool, id: WatcherId) -> Result<Option<Watcher>, WatchpostError> {
    let row = sqlx::query_as::<_, WatcherRow>(&format!("{SELECT_WATCHER} WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(Watcher::try_from).transpose()
}

async fn list_watchers(pool: &SqlitePool) -> Result<Vec<Watcher>, WatchpostError> {
    let rows = sqlx::query_as::<_, WatcherRow>(&format!("{SELECT_WATCHER} ORDER BY id"))
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(Watcher::try_from).collect()
}

async fn list_watchers_by_source(
    pool: &SqlitePool,
    source_id: SourceId,
) -> Result<Vec<Watcher>, WatchpostError> {
    let rows =
        sqlx::query_as::<_, WatcherRow>(&format!("{SELECT_WATCHER} WHERE source_id = ? ORDER BY id"))
            .bind(source_id)
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(Watcher::try_from).collect()
}

async fn increment_trigger_count(pool: &SqlitePool, id: WatcherId) -> Result<(), WatchpostError> {
    let res = sqlx::query("UPDATE watchers SET trigger_count = trigger_count + 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        // Watcher deleted while a delivery was in flight; nothing to count against.
        debug!(watcher_id = id, "trigger count increment hit no row");
    }
    Ok(())
}

async fn create_source(
    pool: &SqlitePool,
    create: SourceCreate,
) -> Result<DatabaseSource, WatchpostError> {
    let now = Utc::now();
    let config = serde_json::to_string(&create.config)?;

    let res = sqlx::query(
        "INSERT INTO sources (name, kind, connection_string, config, enabled, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&create.name)
    .bind(create.kind.as_str())
    .bind(&create.connection_string)
    .bind(&config)
    .bind(create.enabled)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let id = res.last_insert_rowid();
    debug!(source_id = id, name = %create.name, "source created");
    get_source(pool, id)
        .await?
        .ok_or_else(|| WatchpostError::Unexpected(format!("source {id} vanished after insert")))
}

async fn patch_source(
    pool: &SqlitePool,
    id: SourceId,
    patch: SourcePatch,
) -> Result<(), WatchpostError> {
    let config = patch.config.as_ref().map(serde_json::to_string).transpose()?;
    let kind = patch.kind.map(|k| k.as_str().to_string());
    let updated_at = Utc::now();

    let res = sqlx::query(
        "UPDATE sources SET \
             name = COALESCE(?, name), \
             kind = COALESCE(?, kind), \
             connection_string = COALESCE(?, connection_string), \
             config = COALESCE(?, config), \
             enabled = COALESCE(?, enabled), \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(&patch.name)
    .bind(&kind)
    .bind(&patch.connection_string)
    .bind(&config)
    .bind(patch.enabled)
    .bind(updated_at)
    .bind(id)
    .execute(pool)
    .await?;

    if res.rows_affected() == 0 {
        return Err(WatchpostError::NotFound(format!("source {id}")));
    }
    Ok(())
}

async fn delete_source(pool: &SqlitePool, id: SourceId) -> Result<(), WatchpostError> {
    let res = sqlx::query("DELETE FROM sources WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(WatchpostError::NotFound(format!("source {id}")));
    }
    Ok(())
}

async fn get_source(
    pool: &SqlitePool,
    id: SourceId,
) -> Result<Option<DatabaseSource>, WatchpostError> {
    let row = sqlx::query_as::<_, SourceRow>(&format!("{SELECT_SOURCE} WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(DatabaseSource::try_from).transpose()
}

async fn list_sources(pool: &SqlitePool) -> Result<Vec<DatabaseSource>, WatchpostError> {
    let rows = sqlx::query_as::<_, SourceRow>(&format!("{SELECT_SOURCE} ORDER BY id"))
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(DatabaseSource::try_from).collect()
}

async fn insert_log(pool: &SqlitePool, log: LogCreate) -> Result<DeliveryLogEntry, WatchpostError> {
    let response = log.response.as_ref().map(serde_json::to_string).transpose()?;
    let error = log.error.as_ref().map(serde_json::to_string).transpose()?;

    let res = sqlx::query(
        "INSERT INTO delivery_logs (watcher_id, operation, status, message, response, error, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(log.watcher_id)
    .bind(log.operation.as_str())
    .bind(log.status.as_str())
    .bind(&log.message)
    .bind(&response)
    .bind(&error)
    .bind(log.created_at)
    .execute(pool)
    .await?;

    Ok(DeliveryLogEntry {
        id: res.last_insert_rowid(),
        watcher_id: log.watcher_id,
        operation: log.operation,
        status: log.status,
        message: log.message,
        response: log.response,
        error: log.error,
        created_at: log.created_at,
    })
}

async fn list_logs(
    pool: &SqlitePool,
    watcher_id: WatcherId,
    limit: i64,
) -> Result<Vec<DeliveryLogEntry>, WatchpostError> {
    let rows = sqlx::query_as::<_, LogRow>(&format!(
        "{SELECT_LOG} WHERE watcher_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
    ))
    .bind(watcher_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(DeliveryLogEntry::try_from).collect()
}

async fn log_stats(pool: &SqlitePool, watcher_id: WatcherId) -> Result<LogStats, WatchpostError> {
    let row = sqlx::query_as::<_, (i64, Option<i64>, Option<i64>, Option<DateTime<Utc>>)>(
        "SELECT COUNT(*), \
                SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), \
                SUM(CASE WHEN status = 'failure' THEN 1 ELSE 0 END), \
                MAX(created_at) \
         FROM delivery_logs WHERE watcher_id = ?",
    )
    .bind(watcher_id)
    .fetch_one(pool)
    .await?;

    Ok(LogStats {
        total: row.0,
        success: row.1.unwrap_or(0),
        failure: row.2.unwrap_or(0),
        last_attempt: row.3,
    })
}

async fn clear_logs(pool: &SqlitePool, watcher_id: WatcherId) -> Result<u64, WatchpostError> {
    let res = sqlx::query("DELETE FROM delivery_logs WHERE watcher_id = ?")
        .bind(watcher_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
