use async_trait::async_trait;
use axum::{Router, body::Bytes, extract::State, http::StatusCode};
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use watchpost::WatchpostError;
use watchpost::config::{CollectionEntry, StandaloneConfig};
use watchpost::engine::{
    ChangeEvent, ChangeFeed, ConnectionPool, DeliveryDispatcher, FeedNamespace,
    ReconnectSupervisor, SourceConnection, SourceConnector, WatcherRegistry,
};
use watchpost::store::{
    self, ConfigStoreHandle, DatabaseSource, OperationKind, SourceCreate, SourceKind, Watcher,
    WatcherCreate,
};

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    opened: Mutex<Vec<(String, String, Vec<OperationKind>)>>,
    namespaces: Mutex<Vec<String>>,
    feeds: Mutex<VecDeque<ChangeFeed>>,
    /// Raw events handed to the next `open_feed`, which applies the requested
    /// operation filter the way a real source does server-side.
    raw_events: Mutex<VecDeque<Vec<ChangeEvent>>>,
}

impl MockState {
    fn with_namespaces(namespaces: &[&str]) -> Arc<Self> {
        let state = Self::default();
        *state.namespaces.lock().unwrap() = namespaces.iter().map(|s| s.to_string()).collect();
        Arc::new(state)
    }

    fn push_feed(&self, feed: ChangeFeed) {
        self.feeds.lock().unwrap().push_back(feed);
    }

    fn push_raw_events(&self, events: Vec<ChangeEvent>) {
        self.raw_events.lock().unwrap().push_back(events);
    }

    fn opened(&self) -> Vec<(String, String, Vec<OperationKind>)> {
        self.opened.lock().unwrap().clone()
    }
}

struct MockConnector {
    state: Arc<MockState>,
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl SourceConnector for MockConnector {
    async fn connect(
        &self,
        _source: &DatabaseSource,
    ) -> Result<Arc<dyn SourceConnection>, WatchpostError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection {
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl SourceConnection for MockConnection {
    async fn list_namespaces(&self) -> Result<Vec<String>, WatchpostError> {
        Ok(self.state.namespaces.lock().unwrap().clone())
    }

    async fn open_feed(
        &self,
        namespace: &str,
        collection: &str,
        operations: &[OperationKind],
    ) -> Result<ChangeFeed, WatchpostError> {
        self.state.opened.lock().unwrap().push((
            namespace.to_string(),
            collection.to_string(),
            operations.to_vec(),
        ));
        if let Some(events) = self.state.raw_events.lock().unwrap().pop_front() {
            let wanted: Vec<OperationKind> = operations.to_vec();
            let filtered = events
                .into_iter()
                .filter(|e| wanted.contains(&e.operation))
                .collect();
            return Ok(feed_of(filtered));
        }
        let queued = self.state.feeds.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| futures::stream::pending().boxed()))
    }

    async fn close(&self) -> Result<(), WatchpostError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An open feed yielding the given events, then staying silent.
fn feed_of(events: Vec<ChangeEvent>) -> ChangeFeed {
    futures::stream::iter(events.into_iter().map(Ok))
        .chain(futures::stream::pending())
        .boxed()
}

fn sample_event(operation: OperationKind) -> ChangeEvent {
    ChangeEvent {
        operation,
        document_id: Some(json!("65f0c0ffee")),
        full_document: Some(json!({ "sku": "A-1" })),
        update_description: None,
        namespace: FeedNamespace {
            database: "appdb".to_string(),
            collection: "orders".to_string(),
        },
        emitted_at: Utc::now(),
    }
}

fn unique_sqlite_path(prefix: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();

    let mut temp_path = std::env::temp_dir();
    temp_path.push(format!(
        "watchpost-{prefix}-{}-{}.sqlite",
        std::process::id(),
        nanos
    ));
    temp_path
}

struct Harness {
    store: ConfigStoreHandle,
    registry: WatcherRegistry,
    state: Arc<MockState>,
    db_path: std::path::PathBuf,
}

async fn harness(prefix: &str, state: Arc<MockState>) -> Harness {
    let db_path = unique_sqlite_path(prefix);
    let store = store::spawn(&format!("sqlite:{}", db_path.display()))
        .await
        .expect("store spawn");
    let dispatcher = DeliveryDispatcher::new(reqwest::Client::new(), Some(store.clone()));
    let pool = ConnectionPool::new(Arc::new(MockConnector {
        state: state.clone(),
    }));
    let registry = WatcherRegistry::new(store.clone(), dispatcher, pool);
    Harness {
        store,
        registry,
        state,
        db_path,
    }
}

impl Harness {
    async fn create_source(&self, connection_string: &str) -> DatabaseSource {
        self.store
            .create_source(SourceCreate {
                name: "primary".to_string(),
                kind: SourceKind::MongoDb,
                connection_string: connection_string.to_string(),
                config: json!({}),
                enabled: true,
            })
            .await
            .expect("create source")
    }

    async fn create_watcher(
        &self,
        name: &str,
        source_id: i64,
        namespace: Option<&str>,
        webhook_url: &str,
    ) -> Watcher {
        self.store
            .create_watcher(WatcherCreate {
                name: name.to_string(),
                source_id,
                collection: "orders".to_string(),
                namespace: namespace.map(str::to_string),
                operations: vec![OperationKind::Insert, OperationKind::Delete],
                webhook_url: webhook_url.to_string(),
                webhook_method: None,
                enabled: true,
                config: json!({}),
            })
            .await
            .expect("create watcher")
    }

    async fn wait_until_inactive(&self) {
        for _ in 0..100 {
            if self.registry.active_watchers().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("watcher did not deactivate in time");
    }

    async fn cleanup(self) {
        self.registry.shutdown().await;
        let _ = tokio::fs::remove_file(&self.db_path).await;
    }
}

#[derive(Clone, Default)]
struct CaptureState {
    hits: Arc<AtomicUsize>,
}

async fn counting_handler(State(state): State<CaptureState>, _body: Bytes) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn spawn_counting_server() -> (String, CaptureState) {
    let state = CaptureState::default();
    let app = Router::new()
        .fallback(counting_handler)
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });
    (format!("http://{addr}/hook"), state)
}

#[tokio::test]
async fn explicit_namespace_wins_over_connection_string() {
    let h = harness(
        "ns-explicit",
        MockState::with_namespaces(&["admin", "appdb"]),
    )
    .await;
    let source = h.create_source("mongodb://localhost:27017/urldb").await;
    let watcher = h
        .create_watcher("w1", source.id, Some("explicitdb"), "http://127.0.0.1:9/h")
        .await;

    h.registry.start(watcher).await.expect("start");
    let opened = h.state.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, "explicitdb");
    assert_eq!(opened[0].1, "orders");
    assert_eq!(
        opened[0].2,
        vec![OperationKind::Insert, OperationKind::Delete]
    );

    h.cleanup().await;
}

#[tokio::test]
async fn namespace_falls_back_to_connection_string() {
    let h = harness("ns-from-url", MockState::with_namespaces(&["admin"])).await;
    let source = h.create_source("mongodb://localhost:27017/urldb").await;
    let watcher = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;

    h.registry.start(watcher).await.expect("start");
    let opened = h.state.opened();
    assert_eq!(opened[0].0, "urldb");

    h.cleanup().await;
}

#[tokio::test]
async fn namespace_falls_back_to_first_non_system_database() {
    let h = harness(
        "ns-discovered",
        MockState::with_namespaces(&["admin", "local", "appdb", "other"]),
    )
    .await;
    let source = h.create_source("mongodb://localhost:27017").await;
    let watcher = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;

    h.registry.start(watcher).await.expect("start");
    let opened = h.state.opened();
    assert_eq!(opened[0].0, "appdb");

    h.cleanup().await;
}

#[tokio::test]
async fn unresolvable_namespace_fails_start_and_releases_connection() {
    let h = harness(
        "ns-unresolvable",
        MockState::with_namespaces(&["admin", "local", "config"]),
    )
    .await;
    let source = h.create_source("mongodb://localhost:27017").await;
    let watcher = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;

    let err = h.registry.start(watcher).await.expect_err("must not start");
    assert!(matches!(err, WatchpostError::Resolution(_)), "got {err:?}");
    assert!(h.registry.active_watchers().await.is_empty());
    // The pooled reference from the failed start is gone.
    assert_eq!(h.state.closes.load(Ordering::SeqCst), 1);

    h.cleanup().await;
}

#[tokio::test]
async fn start_is_idempotent_for_an_active_watcher() {
    let h = harness("idempotent-start", MockState::with_namespaces(&["appdb"])).await;
    let source = h.create_source("mongodb://localhost:27017/appdb").await;
    let watcher = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;

    h.registry.start(watcher.clone()).await.expect("first start");
    h.registry.start(watcher).await.expect("second start");

    assert_eq!(h.state.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.state.opened().len(), 1);
    assert_eq!(h.registry.active_watchers().await.len(), 1);

    h.cleanup().await;
}

#[tokio::test]
async fn stopping_an_unregistered_watcher_is_a_no_op() {
    let h = harness("stop-unknown", MockState::with_namespaces(&["appdb"])).await;
    h.registry.stop(424242).await.expect("stop must succeed");
    assert_eq!(h.state.connects.load(Ordering::SeqCst), 0);
    h.cleanup().await;
}

#[tokio::test]
async fn watchers_on_one_source_share_a_connection() {
    let h = harness("shared-conn", MockState::with_namespaces(&["appdb"])).await;
    let source = h.create_source("mongodb://localhost:27017/appdb").await;
    let w1 = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;
    let w2 = h
        .create_watcher("w2", source.id, None, "http://127.0.0.1:9/h")
        .await;

    h.registry.start(w1.clone()).await.expect("start w1");
    h.registry.start(w2.clone()).await.expect("start w2");
    assert_eq!(h.state.connects.load(Ordering::SeqCst), 1);

    h.registry.stop(w1.id).await.expect("stop w1");
    assert_eq!(h.state.closes.load(Ordering::SeqCst), 0);

    h.registry.stop(w2.id).await.expect("stop w2");
    assert_eq!(h.state.closes.load(Ordering::SeqCst), 1);

    h.cleanup().await;
}

#[tokio::test]
async fn feed_events_are_delivered_and_counted() {
    let state = MockState::with_namespaces(&["appdb"]);
    state.push_feed(feed_of(vec![
        sample_event(OperationKind::Insert),
        sample_event(OperationKind::Delete),
    ]));
    let h = harness("deliveries", state).await;

    let (hook_url, capture) = spawn_counting_server().await;
    let source = h.create_source("mongodb://localhost:27017/appdb").await;
    let watcher = h.create_watcher("w1", source.id, None, &hook_url).await;

    h.registry.start(watcher.clone()).await.expect("start");

    for _ in 0..100 {
        if capture.hits.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(capture.hits.load(Ordering::SeqCst), 2);

    // One log entry and one counter bump per attempt.
    for _ in 0..100 {
        let fetched = h
            .store
            .get_watcher(watcher.id)
            .await
            .expect("get watcher")
            .expect("watcher exists");
        if fetched.trigger_count == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let logs = h.store.list_logs(watcher.id, 100).await.expect("logs");
    assert_eq!(logs.len(), 2);

    // The feed stays open after deliveries.
    assert_eq!(h.registry.active_watchers().await.len(), 1);

    h.cleanup().await;
}

#[tokio::test]
async fn excluded_operations_produce_no_delivery_attempts() {
    let state = MockState::with_namespaces(&["appdb"]);
    state.push_raw_events(vec![
        sample_event(OperationKind::Insert),
        sample_event(OperationKind::Delete),
        sample_event(OperationKind::Update),
    ]);
    let h = harness("op-filter", state).await;

    let (hook_url, capture) = spawn_counting_server().await;
    let source = h.create_source("mongodb://localhost:27017/appdb").await;
    let watcher = h
        .store
        .create_watcher(WatcherCreate {
            name: "w1".to_string(),
            source_id: source.id,
            collection: "orders".to_string(),
            namespace: None,
            operations: vec![OperationKind::Insert, OperationKind::Update],
            webhook_url: hook_url.clone(),
            webhook_method: None,
            enabled: true,
            config: json!({}),
        })
        .await
        .expect("create watcher");

    h.registry.start(watcher.clone()).await.expect("start");

    // The insert and the update get through; the delete never does.
    for _ in 0..100 {
        if capture.hits.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(capture.hits.load(Ordering::SeqCst), 2);

    let logs = h.store.list_logs(watcher.id, 100).await.expect("logs");
    assert_eq!(logs.len(), 2);
    assert!(
        logs.iter().all(|l| l.operation != OperationKind::Delete),
        "no attempt may exist for a filtered-out operation"
    );

    h.cleanup().await;
}

#[tokio::test]
async fn feed_fault_deactivates_the_watcher() {
    let state = MockState::with_namespaces(&["appdb"]);
    state.push_feed(
        futures::stream::iter(vec![Err(WatchpostError::Feed(
            "resume token expired".to_string(),
        ))])
        .boxed(),
    );
    let h = harness("feed-fault", state).await;

    let source = h.create_source("mongodb://localhost:27017/appdb").await;
    let watcher = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;

    h.registry.start(watcher.clone()).await.expect("start");
    h.wait_until_inactive().await;
    // Deactivation released the last pooled reference.
    for _ in 0..100 {
        if h.state.closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.state.closes.load(Ordering::SeqCst), 1);

    // The watcher can be started again by hand.
    h.registry.start(watcher).await.expect("restart after fault");
    assert_eq!(h.registry.active_watchers().await.len(), 1);

    h.cleanup().await;
}

#[tokio::test]
async fn restart_swaps_in_exactly_one_new_subscription() {
    let h = harness("restart", MockState::with_namespaces(&["appdb"])).await;
    let source = h.create_source("mongodb://localhost:27017/appdb").await;
    let watcher = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;

    h.registry.start(watcher.clone()).await.expect("start");
    let before = h.registry.active_watchers().await;
    assert_eq!(before.len(), 1);

    let mut changed = watcher.clone();
    changed.collection = "invoices".to_string();
    h.registry.restart(changed).await.expect("restart");

    let after = h.registry.active_watchers().await;
    assert_eq!(after.len(), 1);
    assert_ne!(
        after[0].subscription_id, before[0].subscription_id,
        "restart must produce a fresh subscription instance"
    );

    // One feed for the original start, one for the restart, nothing more.
    let opened = h.state.opened();
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[1].1, "invoices");

    h.cleanup().await;
}

#[tokio::test]
async fn concurrent_restart_and_start_leave_one_live_subscription() {
    let h = harness("restart-race", MockState::with_namespaces(&["appdb"])).await;
    let source = h.create_source("mongodb://localhost:27017/appdb").await;
    let watcher = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;

    h.registry.start(watcher.clone()).await.expect("start");

    // The slot lock serializes both; whichever runs second sees a consistent
    // active entry. Either order ends with exactly one subscription.
    let (restarted, started) = tokio::join!(
        h.registry.restart(watcher.clone()),
        h.registry.start(watcher.clone()),
    );
    restarted.expect("restart");
    started.expect("start");

    assert_eq!(h.registry.active_watchers().await.len(), 1);
    assert_eq!(h.state.opened().len(), 2);

    h.cleanup().await;
}

fn standalone_cfg(reconnect_interval_ms: u64) -> StandaloneConfig {
    StandaloneConfig {
        enabled: true,
        mongo_url: "mongodb://localhost:27017/appdb".to_string(),
        database: Some("appdb".to_string()),
        reconnect_interval_ms,
        collections: vec![CollectionEntry {
            name: "orders".to_string(),
            webhook_url: "http://127.0.0.1:9/hook".to_string(),
            method: None,
            operations: vec![OperationKind::Insert],
            enabled: true,
        }],
    }
}

fn standalone_supervisor(
    cfg: StandaloneConfig,
    state: Arc<MockState>,
) -> Result<ReconnectSupervisor, WatchpostError> {
    ReconnectSupervisor::new(
        cfg,
        Arc::new(MockConnector { state }),
        DeliveryDispatcher::new(reqwest::Client::new(), None),
    )
}

#[tokio::test]
async fn standalone_relay_rebuilds_after_a_feed_fault() {
    let state = MockState::with_namespaces(&["appdb"]);
    state.push_feed(
        futures::stream::iter(vec![Err::<ChangeEvent, _>(WatchpostError::Feed(
            "cursor died".to_string(),
        ))])
        .boxed(),
    );

    let supervisor =
        Arc::new(standalone_supervisor(standalone_cfg(50), state.clone()).expect("valid config"));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run(shutdown_rx).await }
    });

    // First generation faults and is torn down; the second connects after the
    // fixed delay and idles on a silent feed.
    for _ in 0..100 {
        if state.connects.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        state.connects.load(Ordering::SeqCst) >= 2,
        "relay did not rebuild after the fault"
    );
    assert!(state.closes.load(Ordering::SeqCst) >= 1);

    shutdown_tx.send(true).expect("send shutdown");
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("relay did not stop on shutdown")
        .expect("relay task join");
}

#[tokio::test]
async fn standalone_relay_rebuilds_after_an_unexpected_feed_close() {
    let state = MockState::with_namespaces(&["appdb"]);
    state.push_feed(futures::stream::empty().boxed());

    let supervisor =
        Arc::new(standalone_supervisor(standalone_cfg(50), state.clone()).expect("valid config"));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run(shutdown_rx).await }
    });

    for _ in 0..100 {
        if state.connects.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        state.connects.load(Ordering::SeqCst) >= 2,
        "a server-side close must also trigger a rebuild"
    );

    shutdown_tx.send(true).expect("send shutdown");
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("relay did not stop on shutdown")
        .expect("relay task join");
}

#[tokio::test]
async fn shutdown_cancels_a_pending_reconnect() {
    let state = MockState::with_namespaces(&["appdb"]);
    state.push_feed(
        futures::stream::iter(vec![Err::<ChangeEvent, _>(WatchpostError::Feed(
            "cursor died".to_string(),
        ))])
        .boxed(),
    );

    // Long delay: the relay sits in its backoff window when shutdown lands.
    let supervisor =
        Arc::new(standalone_supervisor(standalone_cfg(60_000), state.clone()).expect("valid config"));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run(shutdown_rx).await }
    });

    for _ in 0..100 {
        if state.closes.load(Ordering::SeqCst) >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.closes.load(Ordering::SeqCst), 1, "teardown did not run");

    shutdown_tx.send(true).expect("send shutdown");
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("pending reconnect was not cancelled")
        .expect("relay task join");
    assert_eq!(
        state.connects.load(Ordering::SeqCst),
        1,
        "no rebuild may happen after shutdown"
    );
}

#[tokio::test]
async fn standalone_config_without_enabled_collections_is_fatal() {
    let state = MockState::with_namespaces(&["appdb"]);

    let mut cfg = standalone_cfg(50);
    cfg.collections.clear();
    let err = standalone_supervisor(cfg, state.clone()).expect_err("must reject");
    assert!(matches!(err, WatchpostError::Configuration(_)), "got {err:?}");

    let mut cfg = standalone_cfg(50);
    cfg.collections[0].webhook_url = String::new();
    let err = standalone_supervisor(cfg, state).expect_err("must reject");
    assert!(matches!(err, WatchpostError::Configuration(_)), "got {err:?}");
}

#[tokio::test]
async fn disabled_watcher_is_rejected() {
    let h = harness("disabled", MockState::with_namespaces(&["appdb"])).await;
    let source = h.create_source("mongodb://localhost:27017/appdb").await;
    let mut watcher = h
        .create_watcher("w1", source.id, None, "http://127.0.0.1:9/h")
        .await;
    watcher.enabled = false;

    let err = h.registry.start(watcher).await.expect_err("must reject");
    assert!(matches!(err, WatchpostError::Configuration(_)), "got {err:?}");
    assert_eq!(h.state.connects.load(Ordering::SeqCst), 0);

    h.cleanup().await;
}
