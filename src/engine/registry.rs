use super::dispatch::DeliveryDispatcher;
use super::pool::ConnectionPool;
use super::subscription::{
    ChangeFeedSubscription, EndReason, SubscriptionEnd, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
use crate::error::WatchpostError;
use crate::store::ConfigStoreHandle;
use crate::store::models::{SourceId, Watcher, WatcherId};
use ahash::AHashMap;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

struct ActiveEntry {
    source_id: SourceId,
    handle: SubscriptionHandle,
}

/// Per-watcher slot. The slot mutex serializes start/stop/restart for one
/// watcher id; distinct ids proceed fully concurrently.
type Slot = Arc<Mutex<Option<ActiveEntry>>>;

struct RegistryInner {
    store: ConfigStoreHandle,
    dispatcher: DeliveryDispatcher,
    pool: ConnectionPool,
    slots: Mutex<AHashMap<WatcherId, Slot>>,
    end_tx: mpsc::Sender<SubscriptionEnd>,
}

impl RegistryInner {
    /// Drops the map entry once a slot is empty, so the map does not grow with
    /// every watcher id ever seen. Holding the map lock blocks new `slot()`
    /// clones; a clone taken earlier shows in the strong count and keeps the
    /// entry alive.
    async fn prune_slot(&self, watcher_id: WatcherId, slot: &Slot) {
        let mut map = self.slots.lock().await;
        let Ok(guard) = slot.try_lock() else { return };
        if guard.is_none() && Arc::strong_count(slot) == 2 {
            map.remove(&watcher_id);
        }
    }
}

/// Snapshot of one running subscription, for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveWatcher {
    pub watcher_id: WatcherId,
    pub subscription_id: SubscriptionId,
    pub state: SubscriptionState,
}

/// Authoritative map of watcher id to running subscription.
///
/// Subscription state lives purely in process memory; it is rebuilt from
/// persisted watcher records at boot via [`WatcherRegistry::start_all`].
#[derive(Clone)]
pub struct WatcherRegistry {
    inner: Arc<RegistryInner>,
}

impl WatcherRegistry {
    pub fn new(
        store: ConfigStoreHandle,
        dispatcher: DeliveryDispatcher,
        pool: ConnectionPool,
    ) -> Self {
        let (end_tx, end_rx) = mpsc::channel(64);
        let inner = Arc::new(RegistryInner {
            store,
            dispatcher,
            pool,
            slots: Mutex::new(AHashMap::new()),
            end_tx,
        });
        tokio::spawn(reap_ended(Arc::downgrade(&inner), end_rx));
        Self { inner }
    }

    /// Starts a subscription for this watcher. Idempotent: a watcher that is
    /// already active is left alone. Any failure leaves the watcher inactive
    /// with no subscription and no pooled reference held.
    pub async fn start(&self, watcher: Watcher) -> Result<(), WatchpostError> {
        let watcher_id = watcher.id;
        let slot = self.slot(watcher_id).await;
        let mut guard = slot.lock().await;
        let res = self.start_locked(&mut guard, watcher).await;
        drop(guard);
        if res.is_err() {
            self.inner.prune_slot(watcher_id, &slot).await;
        }
        res
    }

    /// Stops and removes the subscription for this id. Idempotent: stopping
    /// an unregistered watcher succeeds with no side effect.
    pub async fn stop(&self, watcher_id: WatcherId) -> Result<(), WatchpostError> {
        let slot = self.slot(watcher_id).await;
        let mut guard = slot.lock().await;
        self.stop_locked(watcher_id, &mut guard).await;
        drop(guard);
        self.inner.prune_slot(watcher_id, &slot).await;
        Ok(())
    }

    /// Stop followed by start, holding the slot for the whole exchange so a
    /// concurrent start cannot slip a second subscription in between.
    pub async fn restart(&self, watcher: Watcher) -> Result<(), WatchpostError> {
        let watcher_id = watcher.id;
        let slot = self.slot(watcher_id).await;
        let mut guard = slot.lock().await;
        self.stop_locked(watcher_id, &mut guard).await;
        let res = self.start_locked(&mut guard, watcher).await;
        drop(guard);
        if res.is_err() {
            self.inner.prune_slot(watcher_id, &slot).await;
        }
        res
    }

    /// Loads persisted watchers and starts the enabled ones. Individual
    /// failures are logged and do not stop the rest.
    pub async fn start_all(&self) -> Result<(), WatchpostError> {
        let watchers = self.inner.store.list_watchers().await?;
        info!(count = watchers.len(), "loaded watcher records");
        let mut started = 0usize;
        for watcher in watchers {
            if !watcher.enabled {
                debug!(watcher = %watcher.name, "skipping disabled watcher");
                continue;
            }
            let name = watcher.name.clone();
            match self.start(watcher).await {
                Ok(()) => started += 1,
                Err(e) => warn!(watcher = %name, error = %e, "failed to start watcher at boot"),
            }
        }
        info!(started, "watcher registry initialized");
        Ok(())
    }

    /// Running subscriptions, for the status API.
    pub async fn active_watchers(&self) -> Vec<ActiveWatcher> {
        let slots: Vec<(WatcherId, Slot)> = {
            let map = self.inner.slots.lock().await;
            map.iter().map(|(id, slot)| (*id, slot.clone())).collect()
        };
        let mut out = Vec::new();
        for (watcher_id, slot) in slots {
            let guard = slot.lock().await;
            if let Some(entry) = guard.as_ref() {
                out.push(ActiveWatcher {
                    watcher_id,
                    subscription_id: entry.handle.id(),
                    state: entry.handle.state(),
                });
            }
        }
        out.sort_by_key(|a| a.watcher_id);
        out
    }

    /// Ordered, best-effort shutdown: close every active subscription, then
    /// close every pooled connection, continuing past individual failures.
    pub async fn shutdown(&self) {
        info!("shutting down watcher registry");
        let slots: Vec<(WatcherId, Slot)> = {
            let map = self.inner.slots.lock().await;
            map.iter().map(|(id, slot)| (*id, slot.clone())).collect()
        };
        for (watcher_id, slot) in slots {
            let mut guard = slot.lock().await;
            self.stop_locked(watcher_id, &mut guard).await;
        }
        self.inner.pool.close_all().await;
        info!("all watchers stopped");
    }

    async fn start_locked(
        &self,
        guard: &mut Option<ActiveEntry>,
        watcher: Watcher,
    ) -> Result<(), WatchpostError> {
        if guard.is_some() {
            info!(watcher_id = watcher.id, watcher = %watcher.name, "watcher already active; start ignored");
            return Ok(());
        }
        if !watcher.enabled {
            return Err(WatchpostError::Configuration(format!(
                "watcher {} is disabled",
                watcher.name
            )));
        }
        if watcher.webhook_url.trim().is_empty() {
            return Err(WatchpostError::Configuration(format!(
                "watcher {} has no webhook url",
                watcher.name
            )));
        }

        let source = self
            .inner
            .store
            .get_source(watcher.source_id)
            .await?
            .ok_or_else(|| {
                WatchpostError::Configuration(format!(
                    "watcher {} references missing source {}",
                    watcher.name, watcher.source_id
                ))
            })?;
        if !source.enabled {
            return Err(WatchpostError::Configuration(format!(
                "source {} is disabled",
                source.name
            )));
        }

        let conn = self.inner.pool.acquire(&source).await?;
        let watcher = Arc::new(watcher);
        match ChangeFeedSubscription::open(
            conn,
            watcher.clone(),
            &source,
            self.inner.dispatcher.clone(),
            self.inner.end_tx.clone(),
        )
        .await
        {
            Ok(handle) => {
                info!(watcher_id = watcher.id, watcher = %watcher.name, "watcher started");
                *guard = Some(ActiveEntry {
                    source_id: source.id,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                self.inner.pool.release(source.id).await;
                error!(watcher = %watcher.name, error = %e, "failed to start watcher");
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, watcher_id: WatcherId, guard: &mut Option<ActiveEntry>) {
        match guard.take() {
            Some(entry) => {
                entry.handle.close().await;
                self.inner.pool.release(entry.source_id).await;
                info!(watcher_id, "watcher stopped");
            }
            None => {
                debug!(watcher_id, "stop for unregistered watcher; nothing to do");
            }
        }
    }

    async fn slot(&self, watcher_id: WatcherId) -> Slot {
        let mut map = self.inner.slots.lock().await;
        map.entry(watcher_id).or_default().clone()
    }
}

/// Consumes terminal subscription signals. A subscription that ends on its
/// own (feed fault or server-side close) deactivates its watcher; an entry
/// already replaced or removed by an explicit stop/restart is left alone,
/// matched by subscription instance id.
async fn reap_ended(inner: Weak<RegistryInner>, mut end_rx: mpsc::Receiver<SubscriptionEnd>) {
    while let Some(end) = end_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match &end.reason {
            EndReason::Failed(e) => error!(
                watcher_id = end.watcher_id,
                error = %e,
                "subscription failed; deactivating watcher"
            ),
            EndReason::Closed => debug!(
                watcher_id = end.watcher_id,
                "subscription closed"
            ),
        }

        let slot = {
            let map = inner.slots.lock().await;
            map.get(&end.watcher_id).cloned()
        };
        let Some(slot) = slot else { continue };
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.take_if(|e| e.handle.id() == end.subscription_id) {
            inner.pool.release(entry.source_id).await;
            info!(watcher_id = end.watcher_id, "watcher deactivated");
        }
        drop(guard);
        inner.prune_slot(end.watcher_id, &slot).await;
    }
}
