use super::dispatch::DeliveryDispatcher;
use super::source::{
    ChangeFeed, RESERVED_NAMESPACES, SourceConnection, namespace_from_connection_string,
};
use crate::error::WatchpostError;
use crate::store::models::{DatabaseSource, Watcher, WatcherId};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

pub type SubscriptionId = Uuid;

/// Lifecycle of one change-feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Inactive,
    Resolving,
    Active,
    Closing,
    Closed,
    Failed,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionState::Closed | SubscriptionState::Failed)
    }
}

/// Why a subscription stopped producing events.
#[derive(Debug)]
pub enum EndReason {
    /// Explicit close, or the source closed the feed.
    Closed,
    /// Feed fault on an active subscription.
    Failed(WatchpostError),
}

/// Single terminal signal emitted by every subscription, consumed by the
/// owning registry or supervisor. Never swallowed.
#[derive(Debug)]
pub struct SubscriptionEnd {
    pub watcher_id: WatcherId,
    pub subscription_id: SubscriptionId,
    pub reason: EndReason,
}

/// Cancellable handle to a live subscription. Dropping the handle also shuts
/// the pump down, so a subscription cannot outlive its owner.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    watcher_id: WatcherId,
    state: watch::Receiver<SubscriptionState>,
    close_tx: watch::Sender<bool>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn watcher_id(&self) -> WatcherId {
        self.watcher_id
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Requests close and waits for the pump to finish. Idempotent: closing
    /// an already-closed subscription is a no-op. An in-flight delivery is
    /// not cancelled; it runs to timeout or completion first.
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        let _ = self.close_tx.send(true);
        let mut rx = self.state.clone();
        loop {
            if rx.borrow().is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Per-watcher change-feed subscription.
///
/// `open` runs the `Resolving` step and activates the feed; the returned
/// handle owns a pump task that forwards each event to the dispatcher in feed
/// order and emits one terminal [`SubscriptionEnd`]. On a resolution or open
/// failure no handle exists and the watcher stays inactive.
pub struct ChangeFeedSubscription;

impl ChangeFeedSubscription {
    pub async fn open(
        conn: Arc<dyn SourceConnection>,
        watcher: Arc<Watcher>,
        source: &DatabaseSource,
        dispatcher: DeliveryDispatcher,
        end_tx: mpsc::Sender<SubscriptionEnd>,
    ) -> Result<SubscriptionHandle, WatchpostError> {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Resolving);

        let namespace = resolve_namespace(conn.as_ref(), &watcher, source).await?;
        let feed = conn
            .open_feed(&namespace, &watcher.collection, &watcher.operations)
            .await?;

        let id = Uuid::new_v4();
        state_tx.send_replace(SubscriptionState::Active);
        info!(
            watcher = %watcher.name,
            namespace = %namespace,
            collection = %watcher.collection,
            subscription = %id,
            "subscription active"
        );

        let (close_tx, close_rx) = watch::channel(false);
        tokio::spawn(pump(feed, watcher.clone(), dispatcher, state_tx, close_rx, end_tx, id));

        Ok(SubscriptionHandle {
            id,
            watcher_id: watcher.id,
            state: state_rx,
            close_tx,
        })
    }
}

/// Determines the logical namespace to watch, in order: explicit name on the
/// watcher, name parsed from the source connection string, then the first
/// non-system namespace on the source. Namespace resolution happens before
/// the feed opens because reserved namespaces cannot host one.
async fn resolve_namespace(
    conn: &dyn SourceConnection,
    watcher: &Watcher,
    source: &DatabaseSource,
) -> Result<String, WatchpostError> {
    let explicit = watcher
        .namespace
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let candidate = explicit.or_else(|| {
        let parsed = namespace_from_connection_string(&source.connection_string);
        if let Some(ns) = &parsed {
            info!(watcher = %watcher.name, namespace = %ns, "parsed namespace from connection string");
        }
        parsed
    });

    if let Some(ns) = candidate {
        if !RESERVED_NAMESPACES.contains(&ns.as_str()) {
            return Ok(ns);
        }
        warn!(
            watcher = %watcher.name,
            namespace = %ns,
            "configured namespace is reserved and cannot host a feed; falling back to discovery"
        );
    }

    let all = conn
        .list_namespaces()
        .await
        .map_err(|e| WatchpostError::Resolution(format!("namespace discovery failed: {e}")))?;
    match all
        .into_iter()
        .find(|ns| !RESERVED_NAMESPACES.contains(&ns.as_str()))
    {
        Some(ns) => {
            warn!(
                watcher = %watcher.name,
                namespace = %ns,
                "namespace not configured; picked the first non-system namespace, which may not be the intended one"
            );
            Ok(ns)
        }
        None => Err(WatchpostError::Resolution(format!(
            "no non-system namespace available for watcher {}",
            watcher.name
        ))),
    }
}

async fn pump(
    mut feed: ChangeFeed,
    watcher: Arc<Watcher>,
    dispatcher: DeliveryDispatcher,
    state_tx: watch::Sender<SubscriptionState>,
    mut close_rx: watch::Receiver<bool>,
    end_tx: mpsc::Sender<SubscriptionEnd>,
    id: SubscriptionId,
) {
    let reason = loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if matches!(changed, Ok(())) && !*close_rx.borrow() {
                    continue;
                }
                state_tx.send_replace(SubscriptionState::Closing);
                break EndReason::Closed;
            }
            item = feed.next() => match item {
                Some(Ok(event)) => {
                    // The outcome is recorded by the dispatcher; the feed
                    // advances regardless of it.
                    dispatcher.deliver(&watcher, &event).await;
                }
                Some(Err(e)) => {
                    error!(watcher = %watcher.name, error = %e, "change feed fault");
                    break EndReason::Failed(e);
                }
                None => {
                    info!(watcher = %watcher.name, "change feed closed by source");
                    break EndReason::Closed;
                }
            }
        }
    };

    let final_state = match &reason {
        EndReason::Closed => SubscriptionState::Closed,
        EndReason::Failed(_) => SubscriptionState::Failed,
    };
    state_tx.send_replace(final_state);

    let _ = end_tx
        .send(SubscriptionEnd {
            watcher_id: watcher.id,
            subscription_id: id,
            reason,
        })
        .await;
}
