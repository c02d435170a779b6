use super::source::{SourceConnection, SourceConnector};
use crate::error::WatchpostError;
use crate::store::models::{DatabaseSource, SourceId};
use ahash::AHashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct PooledEntry {
    conn: Arc<dyn SourceConnection>,
    refs: usize,
}

/// Reference-counted cache of live source connections, keyed by source id.
///
/// Connections are opened lazily on first acquire, shared by every watcher
/// targeting the same source, and closed when the last reference is released
/// or at shutdown. Owned by one service instance, never ambient.
pub struct ConnectionPool {
    connector: Arc<dyn SourceConnector>,
    inner: Mutex<AHashMap<SourceId, PooledEntry>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn SourceConnector>) -> Self {
        Self {
            connector,
            inner: Mutex::new(AHashMap::new()),
        }
    }

    /// Returns the shared handle for this source, opening a new connection if
    /// none is cached. Establishment failures surface to the caller; the pool
    /// does not retry.
    pub async fn acquire(
        &self,
        source: &DatabaseSource,
    ) -> Result<Arc<dyn SourceConnection>, WatchpostError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.get_mut(&source.id) {
                entry.refs += 1;
                debug!(source_id = source.id, refs = entry.refs, "reusing pooled connection");
                return Ok(entry.conn.clone());
            }
        }

        // Connect outside the lock so a slow source does not stall unrelated
        // acquires. Two racing acquires may both connect; the loser's handle
        // is closed and the cached one wins.
        let conn = self.connector.connect(source).await?;

        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(&source.id) {
            entry.refs += 1;
            let existing = entry.conn.clone();
            drop(inner);
            if let Err(e) = conn.close().await {
                warn!(source_id = source.id, error = %e, "failed to close redundant connection");
            }
            return Ok(existing);
        }
        info!(source_id = source.id, name = %source.name, "opened connection to source");
        inner.insert(
            source.id,
            PooledEntry {
                conn: conn.clone(),
                refs: 1,
            },
        );
        Ok(conn)
    }

    /// Drops one reference; the underlying connection is closed only when the
    /// count reaches zero.
    pub async fn release(&self, source_id: SourceId) {
        let to_close = {
            let mut inner = self.inner.lock().await;
            match inner.get_mut(&source_id) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    debug!(source_id, refs = entry.refs, "released pooled connection");
                    None
                }
                Some(_) => inner.remove(&source_id).map(|entry| entry.conn),
                None => {
                    debug!(source_id, "release for unknown source; ignoring");
                    None
                }
            }
        };

        if let Some(conn) = to_close {
            info!(source_id, "closing connection to source (last reference released)");
            if let Err(e) = conn.close().await {
                warn!(source_id, error = %e, "failed to close source connection");
            }
        }
    }

    /// Unconditionally closes every cached handle. Used at shutdown; close
    /// failures are logged and do not abort the remaining closes.
    pub async fn close_all(&self) {
        let drained: Vec<(SourceId, PooledEntry)> = {
            let mut inner = self.inner.lock().await;
            inner.drain().collect()
        };
        for (source_id, entry) in drained {
            if let Err(e) = entry.conn.close().await {
                warn!(source_id, error = %e, "failed to close pooled connection");
            }
        }
    }
}
