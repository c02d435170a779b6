use super::dispatch::DeliveryDispatcher;
use super::source::{SourceConnection, SourceConnector};
use super::subscription::{
    ChangeFeedSubscription, EndReason, SubscriptionEnd, SubscriptionHandle,
};
use crate::config::StandaloneConfig;
use crate::error::WatchpostError;
use crate::store::models::{DatabaseSource, SourceKind, Watcher};
use backon::{BackoffBuilder, ConstantBuilder};
use chrono::Utc;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Standalone-relay mode: one self-contained process watching a fixed set of
/// collections from config, with no registry and no configuration store.
///
/// Any feed fault or unexpected close tears the whole relay down and rebuilds
/// everything (connection plus every subscription) after a fixed delay. A
/// pending rebuild is cancelled when shutdown is requested.
pub struct ReconnectSupervisor {
    cfg: StandaloneConfig,
    connector: Arc<dyn SourceConnector>,
    dispatcher: DeliveryDispatcher,
    watchers: Vec<Arc<Watcher>>,
    source: DatabaseSource,
}

impl std::fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("cfg", &self.cfg)
            .field("watchers", &self.watchers)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl ReconnectSupervisor {
    /// Validates the standalone configuration up front; these errors are
    /// fatal in this mode.
    pub fn new(
        cfg: StandaloneConfig,
        connector: Arc<dyn SourceConnector>,
        dispatcher: DeliveryDispatcher,
    ) -> Result<Self, WatchpostError> {
        let enabled: Vec<_> = cfg.collections.iter().filter(|c| c.enabled).collect();
        if enabled.is_empty() {
            return Err(WatchpostError::Configuration(
                "no collections enabled in standalone configuration".to_string(),
            ));
        }
        if let Some(entry) = enabled.iter().find(|c| c.webhook_url.trim().is_empty()) {
            return Err(WatchpostError::Configuration(format!(
                "collection {} has no webhook url",
                entry.name
            )));
        }

        let now = Utc::now();
        let watchers = enabled
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                Arc::new(Watcher {
                    id: i as i64 + 1,
                    name: entry.name.clone(),
                    source_id: 0,
                    collection: entry.name.clone(),
                    namespace: cfg.database.clone(),
                    operations: entry.operations.clone(),
                    webhook_url: entry.webhook_url.clone(),
                    webhook_method: entry.method,
                    enabled: true,
                    trigger_count: 0,
                    config: Value::Object(serde_json::Map::new()),
                    created_at: now,
                    updated_at: now,
                })
            })
            .collect();
        let source = DatabaseSource {
            id: 0,
            name: "standalone".to_string(),
            kind: SourceKind::MongoDb,
            connection_string: cfg.mongo_url.clone(),
            config: Value::Object(serde_json::Map::new()),
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        Ok(Self {
            cfg,
            connector,
            dispatcher,
            watchers,
            source,
        })
    }

    /// Runs until shutdown is requested, rebuilding after each fault.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let delay = Duration::from_millis(self.cfg.reconnect_interval_ms);
        let mut backoff = ConstantBuilder::default()
            .with_delay(delay)
            .without_max_times()
            .build();

        loop {
            match self.run_once(&mut shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    let pause = backoff.next().unwrap_or(delay);
                    warn!(
                        error = %e,
                        delay_ms = pause.as_millis() as u64,
                        "relay fault; scheduling full rebuild"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(pause) => {}
                        () = wait_for_shutdown(&mut shutdown) => {
                            info!("shutdown requested; cancelling pending reconnect");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One relay generation: connect, open every feed, then wait for the
    /// first terminal signal or shutdown. `Ok(())` means shutdown.
    async fn run_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WatchpostError> {
        info!("connecting to source");
        let conn = self.connector.connect(&self.source).await?;

        let (end_tx, mut end_rx) = mpsc::channel(16);
        let mut handles: Vec<SubscriptionHandle> = Vec::new();
        for watcher in &self.watchers {
            match ChangeFeedSubscription::open(
                conn.clone(),
                watcher.clone(),
                &self.source,
                self.dispatcher.clone(),
                end_tx.clone(),
            )
            .await
            {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    teardown(&handles, conn.as_ref()).await;
                    return Err(e);
                }
            }
        }
        drop(end_tx);
        info!(feeds = handles.len(), "listening for changes");

        let result = tokio::select! {
            () = wait_for_shutdown(shutdown) => {
                info!("shutting down standalone relay");
                Ok(())
            }
            end = end_rx.recv() => match end {
                Some(SubscriptionEnd { reason: EndReason::Failed(e), .. }) => Err(e),
                Some(SubscriptionEnd { watcher_id, reason: EndReason::Closed, .. }) => {
                    Err(WatchpostError::Feed(format!(
                        "change feed for watcher {watcher_id} closed unexpectedly"
                    )))
                }
                None => Err(WatchpostError::Feed("all subscriptions ended".to_string())),
            },
        };

        teardown(&handles, conn.as_ref()).await;
        result
    }
}

async fn teardown(handles: &[SubscriptionHandle], conn: &dyn SourceConnection) {
    for handle in handles {
        handle.close().await;
    }
    if let Err(e) = conn.close().await {
        warn!(error = %e, "failed to close source connection");
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
